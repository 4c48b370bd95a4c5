//! Handler execution with a deadline and panic capture.

use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::transport::DeliveryInfo;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

/// Runs the handler on its own task and waits at most `limit` for it.
///
/// On timeout the task is left running detached; whatever it returns later is dropped
/// and cannot change the outcome already reported. A panic counts as a handler error.
pub async fn run_guarded(
    handler: Arc<dyn MessageHandler>,
    content: Value,
    delivery: DeliveryInfo,
    limit: Duration,
) -> Result<(), WorkerError> {
    let task = tokio::spawn(async move { handler.handle(content, delivery).await });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(WorkerError::Handler(e)),
        Ok(Err(join_error)) => Err(WorkerError::Handler(panic_message(join_error).into())),
        Err(_) => Err(WorkerError::HandlerTimeout(limit)),
    }
}

fn panic_message(join_error: JoinError) -> String {
    if join_error.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = join_error.into_panic();
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::handler::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn delivery() -> DeliveryInfo {
        DeliveryInfo {
            delivery_tag: 1,
            redelivered: false,
            exchange: "tasks".to_string(),
            routing_key: "slow".to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_and_error_pass_through() {
        let ok = Arc::new(handler_fn("ok", |_, _| async { Ok::<(), BoxError>(()) }));
        assert!(run_guarded(ok, json!({}), delivery(), Duration::from_secs(1)).await.is_ok());

        let failing = Arc::new(handler_fn("fail", |_, _| async { Err::<(), BoxError>("boom".into()) }));
        let err = run_guarded(failing, json!({}), delivery(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Handler(ref e) if e.to_string() == "boom"));
    }

    #[tokio::test]
    async fn test_hanging_handler_times_out_and_late_result_is_ignored() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow = Arc::new(handler_fn("slow", move |_, _| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        }));

        let err = run_guarded(slow, json!({}), delivery(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::HandlerTimeout(d) if d == Duration::from_millis(20)));

        // The abandoned task keeps running to completion on its own.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_becomes_handler_error() {
        let panicking = Arc::new(handler_fn("panics", |_, _| async {
            if true {
                panic!("bad input");
            }
            Ok::<(), BoxError>(())
        }));

        let err = run_guarded(panicking, json!({}), delivery(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler panicked: bad input"));
    }
}
