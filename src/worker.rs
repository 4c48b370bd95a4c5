//! The worker process: owns one configuration, one connection and one channel.

use crate::amqp::LapinTransport;
use crate::channel;
use crate::config::{Configuration, WorkerConfig, WorkerOptions};
use crate::connection;
use crate::dispatch;
use crate::error::WorkerError;
use crate::events::{EventBus, WorkerEvent};
use crate::handler::Handlers;
use crate::shutdown::{self, ExitHook, Session, ShutdownController};
use crate::transport::{BrokerChannel, BrokerConnection, Transport};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Validates the inputs and returns a worker that talks to RabbitMQ through `lapin`.
///
/// Nothing is opened until `listen()` is called.
pub fn create_worker(
    handlers: impl Into<Handlers>,
    config: WorkerConfig,
    options: WorkerOptions,
) -> Result<WorkerProcess, WorkerError> {
    let configuration = Configuration::new(handlers, config, options)?;
    Ok(WorkerProcess::new(configuration, LapinTransport::new()))
}

/// A running (or ready to run) task worker.
///
/// Cloning is cheap and every clone drives the same worker, so one task can
/// `wait()` while another calls `close()`.
#[derive(Clone)]
pub struct WorkerProcess {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    configuration: Arc<Configuration>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    shutdown: Arc<ShutdownController>,
    session: Mutex<Option<Session>>,
}

impl WorkerInner {
    fn new(
        configuration: Arc<Configuration>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        exit: ExitHook,
    ) -> Self {
        let shutdown = Arc::new(ShutdownController::new(&configuration, events.clone(), exit));
        Self {
            configuration,
            transport,
            events,
            shutdown,
            session: Mutex::new(None),
        }
    }
}

impl WorkerProcess {
    pub fn new(configuration: Configuration, transport: impl Transport + 'static) -> Self {
        let inner = WorkerInner::new(
            Arc::new(configuration),
            Arc::new(transport),
            EventBus::new(),
            ShutdownController::process_exit(),
        );
        Self { inner: Arc::new(inner) }
    }

    /// Replaces what `close(true)` and a forced connection close call to end the process.
    ///
    /// Meant to be called right after construction: a session opened earlier is
    /// not carried over.
    pub fn with_exit_hook(self, exit: ExitHook) -> Self {
        let inner = WorkerInner::new(
            self.inner.configuration.clone(),
            self.inner.transport.clone(),
            self.inner.events.clone(),
            exit,
        );
        Self { inner: Arc::new(inner) }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    fn worker_name(&self) -> &str {
        self.inner.configuration.worker_name()
    }

    /// Connects, opens the channel, binds every handler and starts consuming.
    ///
    /// A connection failure is returned as `WorkerError::Connection`; nothing is
    /// retried. Calling it again while listening is a `WorkerError::State`.
    pub async fn listen(&self) -> Result<(), WorkerError> {
        let runtime = Handle::try_current()
            .map_err(|e| WorkerError::State(format!("listen() needs a Tokio runtime: {}", e)))?;

        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            return Err(WorkerError::State(format!(
                "worker '{}' is already listening",
                self.worker_name()
            )));
        }

        let configuration = &self.inner.configuration;
        let connection = connection::open(
            self.inner.transport.as_ref(),
            configuration,
            self.inner.shutdown.clone(),
            runtime,
        )
        .await?;

        let (channel, consumers) = match self.open_bindings(connection.as_ref()).await {
            Ok(opened) => opened,
            Err(e) => {
                log::error!(
                    "[{}] Failed to set up consumers. error={}, {}",
                    self.worker_name(),
                    e,
                    configuration.log_context()
                );
                if let Err(close_err) = connection.close().await {
                    log::warn!(
                        "[{}] Failed to close connection after setup error. error={}",
                        self.worker_name(),
                        close_err
                    );
                }
                return Err(e);
            }
        };

        let signal_watcher = if configuration.options().close_on_signals {
            Some(self.watch_signals())
        } else {
            None
        };

        *session = Some(Session {
            connection,
            channel,
            consumers,
            signal_watcher,
        });

        log::info!(
            "[{}] Worker is listening. {}",
            self.worker_name(),
            configuration.log_context()
        );
        Ok(())
    }

    async fn open_bindings(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<(Arc<dyn BrokerChannel>, Vec<JoinHandle<()>>), WorkerError> {
        let channel = channel::open(connection, &self.inner.configuration).await?;
        let consumers =
            dispatch::bind_all(channel.as_ref(), &self.inner.configuration, &self.inner.events).await?;
        Ok((channel, consumers))
    }

    /// Closes the worker on SIGINT/SIGTERM. Holds only a weak reference, so a
    /// dropped worker is not kept alive by its watcher.
    fn watch_signals(&self) -> JoinHandle<()> {
        let worker: Weak<WorkerInner> = Arc::downgrade(&self.inner);
        let worker_name = self.worker_name().to_string();

        tokio::spawn(async move {
            if let Err(e) = shutdown::termination_signal().await {
                log::error!("[{}] Cannot listen for termination signals. error={}", worker_name, e);
                return;
            }
            log::info!("[{}] Termination signal received", worker_name);

            let Some(inner) = worker.upgrade() else {
                return;
            };
            // close() aborts this watcher, so it runs on its own task.
            let worker = WorkerProcess { inner };
            tokio::spawn(async move {
                if let Err(e) = worker.close(true).await {
                    log::error!("[{}] Close on signal failed. error={}", worker.worker_name(), e);
                }
            });
        })
    }

    /// Closes the channel and then the connection.
    ///
    /// With `force_exit` the process exits after `processExitTimeoutMs`. A worker that
    /// is not listening is left as it is.
    pub async fn close(&self, force_exit: bool) -> Result<(), WorkerError> {
        let session = self.inner.session.lock().await.take();
        self.inner.shutdown.close(session, force_exit).await
    }

    /// Resolves on the next `event` emitted after this call, or fails with
    /// `WorkerError::WaitTimeout` once `timeout` has elapsed.
    pub fn wait(
        &self,
        event: WorkerEvent,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send + 'static {
        self.inner.events.wait(event, timeout)
    }

    /// Every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_listening(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }
}
