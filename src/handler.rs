//! Defines the traits for message handling and validation, and the routing-key bindings.

use crate::error::BoxError;
use crate::transport::DeliveryInfo;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A trait for processing the parsed content of a delivery.
///
/// Handlers run on their own Tokio task and may be invoked concurrently, up to the
/// channel prefetch count. Returning `Err` (or exceeding the task timeout) makes the
/// worker retry the message once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single message.
    ///
    /// # Arguments
    /// * `content` - The JSON payload of the delivery.
    /// * `delivery` - Broker metadata, including the `redelivered` flag.
    async fn handle(&self, content: Value, delivery: DeliveryInfo) -> Result<(), BoxError>;

    /// A name for the handler, used for logging.
    fn handler_name(&self) -> &str {
        "handler"
    }
}

/// Checks parsed content before it reaches the handler. A rejection is permanent.
pub trait Validator: Send + Sync {
    fn validate(&self, content: &Value) -> Result<(), BoxError>;
}

/// Adapts an async closure into a `MessageHandler`.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wraps `f` as a handler named `name`.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Value, DeliveryInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnHandler { name: name.into(), f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, DeliveryInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn handle(&self, content: Value, delivery: DeliveryInfo) -> Result<(), BoxError> {
        (self.f)(content, delivery).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Adapts a closure into a `Validator`.
pub struct FnValidator<F>(F);

pub fn validator_fn<F>(f: F) -> FnValidator<F>
where
    F: Fn(&Value) -> Result<(), BoxError> + Send + Sync,
{
    FnValidator(f)
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Result<(), BoxError> + Send + Sync,
{
    fn validate(&self, content: &Value) -> Result<(), BoxError> {
        (self.0)(content)
    }
}

/// Binds a handler (and optional validator) to one routing key.
#[derive(Clone)]
pub struct HandlerSpec {
    pub routing_key: String,
    pub handler: Arc<dyn MessageHandler>,
    pub validator: Option<Arc<dyn Validator>>,
}

impl HandlerSpec {
    pub fn new(routing_key: impl Into<String>, handler: impl MessageHandler + 'static) -> Self {
        Self {
            routing_key: routing_key.into(),
            handler: Arc::new(handler),
            validator: None,
        }
    }

    /// Runs `validator` on every parsed message before the handler.
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("routing_key", &self.routing_key)
            .field("handler", &self.handler.handler_name())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// The handler argument accepted by `create_worker`.
///
/// `Single` is the legacy call shape: one handler whose routing key comes from
/// `WorkerConfig::routing_key`. It is turned into a one-element list during validation.
pub enum Handlers {
    List(Vec<HandlerSpec>),
    Single(Arc<dyn MessageHandler>),
}

impl Handlers {
    pub fn single(handler: impl MessageHandler + 'static) -> Self {
        Handlers::Single(Arc::new(handler))
    }
}

impl From<Vec<HandlerSpec>> for Handlers {
    fn from(specs: Vec<HandlerSpec>) -> Self {
        Handlers::List(specs)
    }
}

impl From<HandlerSpec> for Handlers {
    fn from(spec: HandlerSpec) -> Self {
        Handlers::List(vec![spec])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery() -> DeliveryInfo {
        DeliveryInfo {
            delivery_tag: 1,
            redelivered: false,
            exchange: "tasks".to_string(),
            routing_key: "email.send".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fn_handler_forwards_content() {
        let handler = handler_fn("echo", |content: Value, info: DeliveryInfo| async move {
            assert_eq!(info.routing_key, "email.send");
            if content["ok"] == json!(true) {
                Ok(())
            } else {
                Err(BoxError::from("not ok"))
            }
        });

        assert_eq!(handler.handler_name(), "echo");
        assert!(handler.handle(json!({"ok": true}), delivery()).await.is_ok());
        assert!(handler.handle(json!({"ok": false}), delivery()).await.is_err());
    }

    #[test]
    fn test_validator_fn() {
        let validator = validator_fn(|content: &Value| {
            if content.get("id").is_some() {
                Ok(())
            } else {
                Err("missing id".into())
            }
        });

        assert!(validator.validate(&json!({"id": 1})).is_ok());
        let err = validator.validate(&json!({})).unwrap_err();
        assert_eq!(err.to_string(), "missing id");
    }

    #[test]
    fn test_handler_spec_debug_hides_closures() {
        let spec = HandlerSpec::new("a.b", handler_fn("noop", |_, _| async { Ok::<(), BoxError>(()) }))
            .with_validator(validator_fn(|_| Ok(())));
        let rendered = format!("{:?}", spec);
        assert!(rendered.contains("a.b"));
        assert!(rendered.contains("noop"));
    }
}
