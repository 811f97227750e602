//! Service lifecycle coordinator
//!
//! Runs the long-lived listeners (MQTT broker, metrics HTTP) as supervised
//! tasks and drives an ordered, deadline-bounded shutdown:
//!
//! `Idle -> Starting -> Running -> ShuttingDown -> Stopped`
//!
//! Listeners are started in registration order and stopped in reverse
//! order, so registering the broker before the HTTP endpoint stops HTTP
//! first. All listeners share a single deadline measured from the moment
//! shutdown begins; a listener still draining at the deadline is aborted.
//!
//! A listener that fails (at startup or while stopping) is logged and
//! otherwise left alone: it never takes its siblings down, and every
//! listener still gets its shutdown step.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Resolve once shutdown has been requested on `rx`.
/// A dropped sender counts as a request.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// A long-running network listener under coordinator control
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Short name used in logs ("mqtt", "metrics")
    fn name(&self) -> &'static str;

    /// Accept and dispatch until `shutdown` flips to true, then drain
    /// in-flight work and return.
    async fn serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// How a listener ended up after shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// Returned cleanly
    Stopped,
    /// Returned an error (at startup or while stopping)
    Failed(String),
    /// Still running at the deadline; aborted
    ForcedClose,
    /// Task panicked
    Panicked,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Per-listener outcome, in shutdown order
    pub outcomes: Vec<(&'static str, ListenerOutcome)>,
    /// Time from cancellation to the end of the last shutdown step
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn outcome(&self, name: &str) -> Option<&ListenerOutcome> {
        self.outcomes.iter().find(|(n, _)| *n == name).map(|(_, o)| o)
    }
}

struct RunningListener {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct Coordinator {
    listeners: Vec<Arc<dyn Listener>>,
    shutdown_timeout: Duration,
    state_tx: watch::Sender<LifecycleState>,
}

impl Coordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        Self { listeners: Vec::new(), shutdown_timeout, state_tx }
    }

    /// Register a listener. Shutdown runs in reverse registration order.
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, state: LifecycleState) {
        self.state_tx.send_replace(state);
        info!(state = ?state, "lifecycle_state");
    }

    /// Start every listener, wait for `cancel`, then shut everything down
    pub async fn run<F>(self, cancel: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        self.transition(LifecycleState::Starting);
        let running: Vec<RunningListener> = self.listeners.iter().map(Self::spawn).collect();

        self.transition(LifecycleState::Running);
        cancel.await;

        self.transition(LifecycleState::ShuttingDown);
        let started = Instant::now();
        let deadline = started + self.shutdown_timeout;
        info!(timeout_ms = %self.shutdown_timeout.as_millis(), "shutdown_started");

        let mut outcomes = Vec::with_capacity(running.len());
        for listener in running.into_iter().rev() {
            let name = listener.name;
            let outcome = Self::stop(listener, deadline).await;
            outcomes.push((name, outcome));
        }

        let report = ShutdownReport { outcomes, elapsed: started.elapsed() };
        self.transition(LifecycleState::Stopped);
        report
    }

    fn spawn(listener: &Arc<dyn Listener>) -> RunningListener {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = listener.name();
        let listener = Arc::clone(listener);

        let handle = tokio::spawn(async move {
            let result = listener.serve(stop_rx).await;
            if let Err(e) = &result {
                error!(listener = name, error = %format!("{e:#}"), "listener_failed");
            }
            result
        });
        info!(listener = name, "listener_spawned");

        RunningListener { name, stop_tx, handle }
    }

    async fn stop(listener: RunningListener, deadline: Instant) -> ListenerOutcome {
        let RunningListener { name, stop_tx, mut handle } = listener;
        // No receivers left just means the listener already returned
        let _ = stop_tx.send(true);

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                info!(listener = name, "listener_stopped");
                ListenerOutcome::Stopped
            }
            // Already logged by the listener task
            Ok(Ok(Err(e))) => ListenerOutcome::Failed(format!("{e:#}")),
            Ok(Err(join_err)) => {
                error!(listener = name, error = %join_err, "listener_panicked");
                ListenerOutcome::Panicked
            }
            Err(_) => {
                warn!(listener = name, "listener_forced_close");
                handle.abort();
                ListenerOutcome::ForcedClose
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Graceful,
        FailOnShutdown,
        FailAtStartup,
        IgnoreShutdown,
    }

    struct FakeListener {
        name: &'static str,
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Listener for FakeListener {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:start", self.name));
            match self.behavior {
                Behavior::FailAtStartup => anyhow::bail!("bind failed"),
                Behavior::IgnoreShutdown => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Behavior::Graceful => {
                    shutdown_requested(&mut shutdown).await;
                    self.log.lock().push(format!("{}:stop", self.name));
                    Ok(())
                }
                Behavior::FailOnShutdown => {
                    shutdown_requested(&mut shutdown).await;
                    self.log.lock().push(format!("{}:stop", self.name));
                    anyhow::bail!("close failed")
                }
            }
        }
    }

    fn listener(
        name: &'static str,
        behavior: Behavior,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Listener> {
        Arc::new(FakeListener { name, behavior, log: log.clone() })
    }

    /// Let spawned listeners reach their first await point
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Coordinator::new(Duration::from_secs(2))
            .with_listener(listener("mqtt", Behavior::Graceful, &log))
            .with_listener(listener("metrics", Behavior::Graceful, &log));

        let report = coordinator.run(settle()).await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0], ("metrics", ListenerOutcome::Stopped));
        assert_eq!(report.outcomes[1], ("mqtt", ListenerOutcome::Stopped));

        let log = log.lock();
        let metrics_stop = log.iter().position(|e| e == "metrics:stop").unwrap();
        let mqtt_stop = log.iter().position(|e| e == "mqtt:stop").unwrap();
        assert!(metrics_stop < mqtt_stop, "metrics should stop before mqtt: {log:?}");
    }

    #[tokio::test]
    async fn test_failed_shutdown_does_not_block_sibling() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Coordinator::new(Duration::from_secs(2))
            .with_listener(listener("mqtt", Behavior::Graceful, &log))
            .with_listener(listener("metrics", Behavior::FailOnShutdown, &log));

        let report = coordinator.run(settle()).await;

        assert!(matches!(
            report.outcome("metrics"),
            Some(ListenerOutcome::Failed(msg)) if msg.contains("close failed")
        ));
        assert_eq!(report.outcome("mqtt"), Some(&ListenerOutcome::Stopped));
        assert!(log.lock().contains(&"mqtt:stop".to_string()));
    }

    #[tokio::test]
    async fn test_startup_failure_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Coordinator::new(Duration::from_secs(2))
            .with_listener(listener("mqtt", Behavior::FailAtStartup, &log))
            .with_listener(listener("metrics", Behavior::Graceful, &log));

        let report = coordinator.run(settle()).await;

        assert!(matches!(
            report.outcome("mqtt"),
            Some(ListenerOutcome::Failed(msg)) if msg.contains("bind failed")
        ));
        assert_eq!(report.outcome("metrics"), Some(&ListenerOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_stuck_listener_forced_close_within_deadline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let timeout = Duration::from_millis(200);
        let coordinator = Coordinator::new(timeout)
            .with_listener(listener("mqtt", Behavior::IgnoreShutdown, &log))
            .with_listener(listener("metrics", Behavior::IgnoreShutdown, &log));

        let report = coordinator.run(settle()).await;

        assert_eq!(report.outcome("metrics"), Some(&ListenerOutcome::ForcedClose));
        assert_eq!(report.outcome("mqtt"), Some(&ListenerOutcome::ForcedClose));
        // One shared deadline, not one per listener
        assert!(report.elapsed < timeout * 2, "took {:?}", report.elapsed);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator = Coordinator::new(Duration::from_secs(1))
            .with_listener(listener("metrics", Behavior::Graceful, &log));
        let mut state = coordinator.subscribe();
        assert_eq!(*state.borrow(), LifecycleState::Idle);

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(coordinator.run(async move {
            let _ = cancel_rx.await;
        }));

        state.wait_for(|s| *s == LifecycleState::Running).await.unwrap();
        cancel_tx.send(()).unwrap();
        run.await.unwrap();

        assert_eq!(*state.borrow(), LifecycleState::Stopped);
    }
}
