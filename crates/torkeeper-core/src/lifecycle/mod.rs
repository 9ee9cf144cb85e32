//! Connection lifecycle management.
//!
//! [`OnionManager`] is a cheap handle to a single background task that owns
//! the Tor process, the control session, the stall watchdog and the bridge
//! configuration. Every public operation is a message to that task, so all
//! lifecycle state has exactly one writer.
//!
//! A connection attempt looks like this:
//!
//! ```text
//! start ─► launch Tor (or push bridge changes) ─► grace delay
//!       ─► connect + authenticate ─► PortsOpened
//!       ─► Progress(n)... ─► circuit established ─► Finished
//!
//! watchdog (30 s, armed on start) ─► DisableNetwork 1/0 ─► Difficulty
//! ```

mod daemon;
pub mod policy;

use crate::bridges::{validate_bridge_line, BridgeConfiguration, BridgesType};
use crate::config::ManagerConfig;
use crate::error::{Error, OnionErrorKind, Result};
use crate::reachability::{NetworkProbe, RouteProbe};
use crate::settings::BridgeSettingsStore;
use crate::tor::{Circuit, ControlChannel, ControlSession, EngineSpawner, TorProcessSpawner};
use daemon::{Command, LifecycleDaemon};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

/// Capacity of the command queue.
const COMMAND_CAPACITY: usize = 32;

/// Capacity of the event broadcast.
const EVENT_CAPACITY: usize = 64;

/// Coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    /// Never started.
    #[default]
    None,
    /// Starting or bootstrapping.
    Started,
    /// A circuit has been established.
    Connected,
    /// Stopped, or stopping.
    Stopped,
}

/// Everything the manager reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnionEvent {
    /// Bootstrap percentage.
    Progress(u8),
    /// A circuit is established with this bridge configuration.
    Finished(BridgeConfiguration),
    /// The attempt is in trouble.
    Difficulty(OnionErrorKind),
    /// The control port accepted our cookie.
    PortsOpened,
    /// Non-fatal problem, e.g. the data directory could not be created.
    Warning(String),
    /// The lifecycle state changed.
    StateChanged(LifecycleState),
}

/// Per-start notification channels.
///
/// A later `start` replaces these; the previous receivers then close.
#[derive(Debug)]
pub struct ConnectionEvents {
    /// Bootstrap percentages, in order. Closed after 100, on stop, or when a
    /// later start replaces this attempt.
    pub progress: mpsc::UnboundedReceiver<u8>,
    /// Fires once authentication succeeded.
    pub ports_opened: oneshot::Receiver<()>,
    /// Fires once a circuit is established.
    pub finished: oneshot::Receiver<BridgeConfiguration>,
    /// Connection difficulties.
    pub difficulties: mpsc::UnboundedReceiver<OnionErrorKind>,
}

/// Sender halves of [`ConnectionEvents`].
#[derive(Debug)]
pub(crate) struct EventSinks {
    progress: Option<mpsc::UnboundedSender<u8>>,
    ports_opened: Option<oneshot::Sender<()>>,
    finished: Option<oneshot::Sender<BridgeConfiguration>>,
    difficulties: mpsc::UnboundedSender<OnionErrorKind>,
}

impl EventSinks {
    pub(crate) fn new() -> (Self, ConnectionEvents) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (ports_tx, ports_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let (difficulty_tx, difficulty_rx) = mpsc::unbounded_channel();
        (
            Self {
                progress: Some(progress_tx),
                ports_opened: Some(ports_tx),
                finished: Some(finished_tx),
                difficulties: difficulty_tx,
            },
            ConnectionEvents {
                progress: progress_rx,
                ports_opened: ports_rx,
                finished: finished_rx,
                difficulties: difficulty_rx,
            },
        )
    }

    pub(crate) fn progress(&mut self, progress: u8) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
        if progress >= 100 {
            self.progress = None;
        }
    }

    pub(crate) fn ports_opened(&mut self) {
        if let Some(tx) = self.ports_opened.take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn finished(&mut self, configuration: BridgeConfiguration) {
        if let Some(tx) = self.finished.take() {
            let _ = tx.send(configuration);
        }
    }

    pub(crate) fn difficulty(&self, kind: OnionErrorKind) {
        let _ = self.difficulties.send(kind);
    }
}

/// Handle to the lifecycle task.
///
/// Clones share the same task. The task ends on [`OnionManager::shutdown`]
/// or when the last handle is dropped, killing Tor.
#[derive(Clone)]
pub struct OnionManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<OnionEvent>,
    config: Arc<ManagerConfig>,
}

impl std::fmt::Debug for OnionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionManager")
            .field("control_addr", &self.config.control_addr)
            .finish_non_exhaustive()
    }
}

impl OnionManager {
    /// Manager driving the real Tor binary, seeded with the bridge
    /// configuration from `store`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ManagerConfig, store: &dyn BridgeSettingsStore) -> Result<Self> {
        let bridges = store.load()?;
        Ok(ManagerBuilder::new(config).bridges(bridges).build())
    }

    /// Builder for custom components.
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::ManagerGone)?;
        rx.await.map_err(|_| Error::ManagerGone)
    }

    /// Start, or restart, a connection attempt.
    ///
    /// Launches Tor if it is not running, otherwise pushes pending bridge
    /// changes to the running instance.
    pub async fn start(&self) -> Result<ConnectionEvents> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop Tor.
    ///
    /// The state becomes [`LifecycleState::Stopped`] right away; the returned
    /// receiver fires once the process has exited.
    pub async fn stop(&self) -> Result<oneshot::Receiver<()>> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop { done })
            .await
            .map_err(|_| Error::ManagerGone)?;
        Ok(rx)
    }

    /// Ask a running Tor to drop and rebuild its connections. No-op when
    /// Tor was never launched.
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| Command::Reconnect { reply }).await
    }

    /// Replace the bridge configuration.
    ///
    /// Returns whether it differs from the previous one. Changes reach a
    /// running Tor on the next [`start`](Self::start).
    pub async fn set_bridge_configuration(
        &self,
        bridges_type: BridgesType,
        custom_bridges: Option<Vec<String>>,
    ) -> Result<bool> {
        if bridges_type == BridgesType::Custom {
            for line in custom_bridges.iter().flatten() {
                validate_bridge_line(line)?;
            }
        }
        let configuration = BridgeConfiguration::new(bridges_type, custom_bridges);
        self.request(|reply| Command::SetBridges {
            configuration,
            reply,
        })
        .await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> Result<LifecycleState> {
        self.request(Command::State).await
    }

    /// Active bridge configuration.
    pub async fn bridge_configuration(&self) -> Result<BridgeConfiguration> {
        self.request(Command::Bridges).await
    }

    /// Whether bridge changes are waiting for the next start.
    pub async fn needs_reconfiguration(&self) -> Result<bool> {
        self.request(Command::NeedsReconfiguration).await
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<OnionEvent> {
        self.events.subscribe()
    }

    /// Fully built circuits. Empty without a control session.
    pub async fn circuits(&self) -> Result<Vec<Circuit>> {
        self.request(Command::Circuits).await?
    }

    /// Close circuits by id. `true` iff every close succeeded.
    pub async fn close_circuits(&self, ids: Vec<String>) -> Result<bool> {
        self.request(|reply| Command::CloseCircuits { ids, reply })
            .await?
    }

    /// Read the control cookie.
    ///
    /// Fails with [`Error::MissingCookieFile`] when no data directory is
    /// configured or Tor has not written the cookie yet.
    pub fn cookie(&self) -> Result<Vec<u8>> {
        self.config.read_cookie()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// End the background task, killing Tor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

type ControlFactory<C> = Box<dyn Fn(SocketAddr) -> C + Send>;

/// Assembles an [`OnionManager`].
pub struct ManagerBuilder<C = ControlSession> {
    config: ManagerConfig,
    bridges: BridgeConfiguration,
    control: ControlFactory<C>,
    spawner: Arc<dyn EngineSpawner>,
    probe: Arc<dyn NetworkProbe>,
}

impl ManagerBuilder<ControlSession> {
    /// Builder with the real control session, process spawner and probe.
    pub fn new(config: ManagerConfig) -> Self {
        let timeout = config.control_timeout;
        Self {
            config,
            bridges: BridgeConfiguration::default(),
            control: Box::new(move |addr| ControlSession::new(addr).with_reply_timeout(timeout)),
            spawner: Arc::new(TorProcessSpawner),
            probe: Arc::new(RouteProbe::default()),
        }
    }
}

impl<C: ControlChannel> ManagerBuilder<C> {
    /// Initial bridge configuration.
    pub fn bridges(mut self, bridges: BridgeConfiguration) -> Self {
        self.bridges = bridges;
        self
    }

    /// Process spawner.
    pub fn spawner(mut self, spawner: Arc<dyn EngineSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Connectivity probe.
    pub fn probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Control session factory, called with the control address each time a
    /// session is needed.
    pub fn control<D, F>(self, factory: F) -> ManagerBuilder<D>
    where
        D: ControlChannel,
        F: Fn(SocketAddr) -> D + Send + 'static,
    {
        ManagerBuilder {
            config: self.config,
            bridges: self.bridges,
            control: Box::new(factory),
            spawner: self.spawner,
            probe: self.probe,
        }
    }

    /// Spawn the lifecycle task. Must be called from within a Tokio runtime.
    pub fn build(self) -> OnionManager {
        let config = Arc::new(self.config);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let daemon = LifecycleDaemon::new(
            config.clone(),
            self.bridges,
            self.control,
            self.spawner,
            self.probe,
            events.clone(),
        );
        tokio::spawn(daemon.run(commands_rx));
        info!(control = %config.control_addr, "Onion manager started");

        OnionManager {
            commands: commands_tx,
            events,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sinks_fire_once() {
        let (mut sinks, mut events) = EventSinks::new();
        sinks.ports_opened();
        sinks.ports_opened();
        sinks.progress(10);
        sinks.progress(100);
        sinks.finished(BridgeConfiguration::default());
        sinks.finished(BridgeConfiguration::new(BridgesType::BuiltIn, None));
        sinks.difficulty(OnionErrorKind::ConnectionDifficulty);

        assert!(events.ports_opened.try_recv().is_ok());
        assert_eq!(events.progress.try_recv().ok(), Some(10));
        assert_eq!(events.progress.try_recv().ok(), Some(100));
        assert_eq!(
            events.finished.try_recv().ok(),
            Some(BridgeConfiguration::default())
        );
        assert_eq!(
            events.difficulties.try_recv().ok(),
            Some(OnionErrorKind::ConnectionDifficulty)
        );
    }

    #[test]
    fn test_progress_closes_after_100() {
        let (mut sinks, mut events) = EventSinks::new();
        sinks.progress(60);
        sinks.progress(100);
        sinks.progress(100);

        assert_eq!(events.progress.try_recv().ok(), Some(60));
        assert_eq!(events.progress.try_recv().ok(), Some(100));
        assert!(matches!(
            events.progress.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        drop(sinks);
    }

    #[test]
    fn test_dropped_sinks_close_receivers() {
        let (sinks, mut events) = EventSinks::new();
        drop(sinks);
        assert!(events.ports_opened.try_recv().is_err());
        assert!(events.progress.try_recv().is_err());
    }

    #[test]
    fn test_default_state() {
        assert_eq!(LifecycleState::default(), LifecycleState::None);
    }
}
