//! Closing the channel and connection, and the forced process exit that may follow.

use crate::config::Configuration;
use crate::error::WorkerError;
use crate::events::{EventBus, WorkerEvent};
use crate::transport::{BrokerChannel, BrokerConnection};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Terminates the process with the given exit code.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Everything opened by a successful `listen()`.
pub struct Session {
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
    pub consumers: Vec<JoinHandle<()>>,
    pub signal_watcher: Option<JoinHandle<()>>,
}

pub struct ShutdownController {
    worker_name: Arc<str>,
    context: String,
    exit_delay: Duration,
    channel_close_timeout: Option<Duration>,
    events: EventBus,
    exit: ExitHook,
    exit_scheduled: AtomicBool,
}

impl ShutdownController {
    pub fn new(configuration: &Configuration, events: EventBus, exit: ExitHook) -> Self {
        Self {
            worker_name: configuration.worker_name().into(),
            context: configuration.log_context(),
            exit_delay: configuration.options().process_exit_duration(),
            channel_close_timeout: configuration.options().channel_close_duration(),
            events,
            exit,
            exit_scheduled: AtomicBool::new(false),
        }
    }

    /// The default hook: `std::process::exit`.
    pub fn process_exit() -> ExitHook {
        Arc::new(|code: i32| {
            std::process::exit(code);
        })
    }

    /// Closes the session's channel, then its connection.
    ///
    /// Failures are logged and shutdown carries on. With `force_exit`, process
    /// termination is scheduled after the configured grace period.
    pub async fn close(&self, session: Option<Session>, force_exit: bool) -> Result<(), WorkerError> {
        let Some(session) = session else {
            log::info!("[{}] close() called but the worker is not listening", self.worker_name);
            return Ok(());
        };

        log::info!(
            "[{}] Closing worker. forceExit={}, processExitTimeoutMs={}, {}",
            self.worker_name,
            force_exit,
            self.exit_delay.as_millis(),
            self.context
        );

        if let Some(watcher) = session.signal_watcher {
            watcher.abort();
        }

        if let Err(e) = self.close_channel(session.channel.as_ref()).await {
            log::error!("[{}] {}. {}", self.worker_name, e, self.context);
        }
        for consumer in session.consumers {
            consumer.abort();
        }

        match session.connection.close().await {
            Ok(()) => log::info!("[{}] Connection closed", self.worker_name),
            Err(e) => {
                let e = WorkerError::Shutdown(format!("failed to close connection: {}", e));
                log::error!("[{}] {}", self.worker_name, e);
            }
        }

        if force_exit {
            self.schedule_exit(&Handle::current());
        }
        self.events.emit(WorkerEvent::WorkerClosed);
        Ok(())
    }

    async fn close_channel(&self, channel: &dyn BrokerChannel) -> Result<(), WorkerError> {
        let closed = match self.channel_close_timeout {
            Some(limit) => tokio::time::timeout(limit, channel.close())
                .await
                .map_err(|_| WorkerError::Shutdown(format!("channel did not close within {:?}", limit)))?,
            None => channel.close().await,
        };
        closed.map_err(|e| WorkerError::Shutdown(format!("failed to close channel: {}", e)))?;
        log::info!("[{}] Channel closed", self.worker_name);
        Ok(())
    }

    /// Exits the process once the grace period has elapsed. Only the first call counts.
    pub fn schedule_exit(&self, runtime: &Handle) {
        if self.exit_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        log::warn!(
            "[{}] Process will exit in {}ms",
            self.worker_name,
            self.exit_delay.as_millis()
        );
        let exit = self.exit.clone();
        let delay = self.exit_delay;
        let worker_name = self.worker_name.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            log::info!("[{}] Exiting process", worker_name);
            exit(0);
        });
    }
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn termination_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
pub async fn termination_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WorkerConfig, WorkerOptions};
    use crate::error::BoxError;
    use crate::handler::{handler_fn, HandlerSpec};
    use std::sync::atomic::AtomicUsize;

    fn controller(exit_delay: Duration, exits: &Arc<AtomicUsize>) -> ShutdownController {
        let config = WorkerConfig::builder("closer", "amqp://localhost")
            .exchange_name("tasks")
            .queue_name("closer")
            .build()
            .unwrap();
        let spec = HandlerSpec::new("k", handler_fn("noop", |_, _| async { Ok::<(), BoxError>(()) }));
        let options = WorkerOptions::default().process_exit_timeout(exit_delay);
        let configuration = Configuration::new(spec, config, options).unwrap();

        let exits = exits.clone();
        ShutdownController::new(
            &configuration,
            EventBus::new(),
            Arc::new(move |_code: i32| {
                exits.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_exit_runs_once_after_grace_period() {
        let exits = Arc::new(AtomicUsize::new(0));
        let shutdown = controller(Duration::from_millis(50), &exits);

        shutdown.schedule_exit(&Handle::current());
        shutdown.schedule_exit(&Handle::current());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_without_session_is_a_no_op() {
        let exits = Arc::new(AtomicUsize::new(0));
        let shutdown = controller(Duration::from_millis(1), &exits);
        let closed = shutdown.events.wait(WorkerEvent::WorkerClosed, Duration::from_millis(50));

        shutdown.close(None, true).await.unwrap();

        assert!(closed.await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }
}
