//! The lifecycle task.
//!
//! Timers (grace delay, watchdog, stop polling) and observers (bootstrap
//! progress, circuit establishment, network changes, transport readiness)
//! post generation-tagged messages back into the task. A message whose
//! generation is no longer current is dropped, which is how cancellation
//! works.
//!
//! Control port commands never run on the task itself. They are spawned and
//! report back through the same channel, so a control port that stops
//! answering cannot hold up stop, queries or the watchdog.

use super::policy::{network_change_delta, startup_arguments};
use super::{ConnectionEvents, EventSinks, LifecycleState, OnionEvent};
use crate::bridges::{BridgeConfiguration, BridgeResolver, ConfStep};
use crate::config::ManagerConfig;
use crate::error::{OnionErrorKind, Result};
use crate::logging::{RedactedBridge, RedactedBytes};
use crate::reachability::{NetworkProbe, NetworkSnapshot, ReachabilityMonitor};
use crate::tor::{
    Circuit, ControlChannel, EngineLaunch, EngineSpawner, EngineStatus, ProcessSupervisor,
    TransportLauncher, TransportProcess,
};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

const DISABLE_NETWORK_KEY: &str = "DisableNetwork";

/// Requests from [`super::OnionManager`].
pub(crate) enum Command {
    Start {
        reply: oneshot::Sender<ConnectionEvents>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<()>,
    },
    SetBridges {
        configuration: BridgeConfiguration,
        reply: oneshot::Sender<bool>,
    },
    State(oneshot::Sender<LifecycleState>),
    Bridges(oneshot::Sender<BridgeConfiguration>),
    NeedsReconfiguration(oneshot::Sender<bool>),
    Circuits(oneshot::Sender<Result<Vec<Circuit>>>),
    CloseCircuits {
        ids: Vec<String>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from timers and observer tasks.
enum Internal {
    ConnectDue { generation: u64 },
    WatchdogFired { generation: u64 },
    Progress { generation: u64, progress: u8 },
    CircuitEstablished { generation: u64 },
    CookieUnavailable { generation: u64 },
    Authenticated { generation: u64 },
    BridgesPushed { result: Result<()> },
    StopPoll,
    NetworkChanged(NetworkSnapshot),
    TransportReady {
        generation: u64,
        result: Result<TransportProcess>,
    },
}

/// An in-flight stop.
struct Stopping {
    status: Option<Arc<EngineStatus>>,
    waiters: Vec<oneshot::Sender<()>>,
}

pub(crate) struct LifecycleDaemon<C: ControlChannel> {
    config: Arc<ManagerConfig>,
    control_factory: Box<dyn Fn(SocketAddr) -> C + Send>,
    control: Option<Arc<C>>,
    authenticated: bool,
    engine: ProcessSupervisor,
    transport: Option<TransportProcess>,
    probe: Arc<dyn NetworkProbe>,
    reachability: ReachabilityMonitor,
    network: NetworkSnapshot,
    bridges: BridgeConfiguration,
    needs_reconfiguration: bool,
    /// A start asked for a bridge push before the session was authenticated.
    push_after_auth: bool,
    state: LifecycleState,
    /// Bumped by every start and stop.
    attempt: u64,
    /// Bumped by every launch and stop.
    launch: u64,
    watchdog: u64,
    watchdog_armed: bool,
    stopping: Option<Stopping>,
    sinks: Option<EventSinks>,
    events: broadcast::Sender<OnionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl<C: ControlChannel> LifecycleDaemon<C> {
    pub(crate) fn new(
        config: Arc<ManagerConfig>,
        bridges: BridgeConfiguration,
        control_factory: Box<dyn Fn(SocketAddr) -> C + Send>,
        spawner: Arc<dyn EngineSpawner>,
        probe: Arc<dyn NetworkProbe>,
        events: broadcast::Sender<OnionEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            control_factory,
            control: None,
            authenticated: false,
            engine: ProcessSupervisor::new(spawner),
            transport: None,
            probe,
            reachability: ReachabilityMonitor::new(),
            network: NetworkSnapshot::default(),
            bridges,
            needs_reconfiguration: false,
            push_after_auth: false,
            state: LifecycleState::None,
            attempt: 0,
            launch: 0,
            watchdog: 0,
            watchdog_armed: false,
            stopping: None,
            sinks: None,
            events,
            internal_tx,
            internal_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            return;
                        }
                    }
                    None => break,
                },
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start { reply } => {
                let events = self.start();
                let _ = reply.send(events);
            }
            Command::Stop { done } => self.stop(done).await,
            Command::Reconnect { reply } => self.reconnect(reply),
            Command::SetBridges {
                configuration,
                reply,
            } => {
                let _ = reply.send(self.set_bridges(configuration));
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Bridges(reply) => {
                let _ = reply.send(self.bridges.clone());
            }
            Command::NeedsReconfiguration(reply) => {
                let _ = reply.send(self.needs_reconfiguration);
            }
            Command::Circuits(reply) => match self.control.clone() {
                Some(control) => {
                    tokio::spawn(async move {
                        let _ = reply.send(control.circuits().await);
                    });
                }
                None => {
                    let _ = reply.send(Ok(Vec::new()));
                }
            },
            Command::CloseCircuits { ids, reply } => match self.control.clone() {
                Some(control) => {
                    tokio::spawn(async move {
                        let _ = reply.send(control.close_circuits(&ids).await);
                    });
                }
                None => {
                    let _ = reply.send(Ok(false));
                }
            },
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::ConnectDue { generation } if generation == self.attempt => {
                self.connect_control();
            }
            Internal::WatchdogFired { generation }
                if generation == self.watchdog && self.watchdog_armed =>
            {
                self.watchdog_fired();
            }
            Internal::Progress {
                generation,
                progress,
            } if generation == self.attempt => {
                debug!(progress, "Bootstrap progress");
                if let Some(sinks) = self.sinks.as_mut() {
                    sinks.progress(progress);
                }
                self.emit(OnionEvent::Progress(progress));
            }
            Internal::CircuitEstablished { generation } if generation == self.attempt => {
                self.circuit_established();
            }
            Internal::CookieUnavailable { generation } if generation == self.attempt => {
                self.difficulty(OnionErrorKind::InvalidBridges);
            }
            Internal::Authenticated { generation } if generation == self.attempt => {
                self.authenticated();
            }
            Internal::BridgesPushed { result } => self.bridges_pushed(result),
            Internal::StopPoll => self.poll_stop(),
            Internal::NetworkChanged(snapshot) => self.network_changed(snapshot),
            Internal::TransportReady { generation, result } if generation == self.launch => {
                self.transport_ready(result);
            }
            Internal::TransportReady { .. } => debug!("Discarding stale transport helper"),
            _ => debug!("Ignoring stale lifecycle message"),
        }
    }

    fn start(&mut self) -> ConnectionEvents {
        self.cancel_watchdog();
        self.attempt += 1;
        let generation = self.attempt;

        let (sinks, events) = EventSinks::new();
        self.sinks = Some(sinks);
        self.set_state(LifecycleState::Started);

        if self.control.is_none() {
            self.control = Some(Arc::new((self.control_factory)(self.config.control_addr)));
        }

        self.observe_reachability();

        if !self.engine.is_running() {
            self.launch_engine();
        } else if self.needs_reconfiguration {
            if self.authenticated {
                self.push_bridges();
            } else {
                debug!("Control port not authenticated, deferring bridge reconfiguration");
                self.push_after_auth = true;
            }
        }

        self.schedule(Internal::ConnectDue { generation }, self.config.grace_delay);
        self.arm_watchdog();
        events
    }

    fn observe_reachability(&mut self) {
        let tx = self.internal_tx.clone();
        let result = self.reachability.start(
            self.probe.clone(),
            self.config.reachability_interval,
            move |snapshot| tx.send(Internal::NetworkChanged(snapshot)).is_ok(),
        );
        match result {
            Ok(snapshot) => self.network = snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to observe reachability");
                self.emit(OnionEvent::Warning(format!(
                    "reachability observation unavailable: {e}"
                )));
            }
        }
    }

    fn launch_engine(&mut self) {
        if let Err(e) = self.config.prepare_data_dir() {
            warn!(error = %e, "Failed to prepare Tor data directory");
            self.emit(OnionEvent::Warning(format!(
                "data directory unavailable: {e}"
            )));
        }

        let resolver = BridgeResolver::new(&self.bridges, &self.config.builtin_bridges);
        for line in resolver.bridge_lines() {
            debug!(bridge = %RedactedBridge(line), "Launching with bridge");
        }
        let arguments = startup_arguments(
            &self.config,
            resolver.as_arguments(),
            self.network.is_ipv6_only(),
            self.bridges.uses_bridges(),
        );
        let launch = EngineLaunch {
            binary: self.config.tor_binary.clone(),
            arguments,
            engine_logging: self.config.engine_logging,
        };

        self.launch += 1;
        match self.engine.start(launch) {
            Ok(()) => info!(pid = ?self.engine.pid(), "Starting Tor"),
            Err(e) => {
                warn!(error = %e, "Failed to start Tor");
                self.emit(OnionEvent::Warning(format!("Tor failed to start: {e}")));
            }
        }
        self.needs_reconfiguration = false;
        self.push_after_auth = false;
        self.launch_transport();
    }

    fn launch_transport(&mut self) {
        let Some(transport) = self.config.transport.clone() else {
            return;
        };
        let state_dir = self
            .config
            .data_dir
            .as_ref()
            .map(|dir| dir.join("pt_state"))
            .unwrap_or_else(|| std::env::temp_dir().join("torkeeper-pt"));
        let generation = self.launch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = launch_transport(&transport, state_dir).await;
            let _ = tx.send(Internal::TransportReady { generation, result });
        });
    }

    fn transport_ready(&mut self, result: Result<TransportProcess>) {
        match result {
            Ok(process) => {
                self.transport = Some(process);
                if self.authenticated {
                    self.register_transports();
                }
            }
            Err(e) => {
                warn!(error = %e, "Pluggable transport helper failed");
                self.emit(OnionEvent::Warning(format!("pluggable transports unavailable: {e}")));
            }
        }
    }

    fn register_transports(&self) {
        let Some(control) = self.control.clone() else {
            return;
        };
        let entries = match &self.transport {
            Some(transport) => transport.conf_entries(),
            None => return,
        };
        if entries.is_empty() {
            return;
        }
        tokio::spawn(async move {
            match control.set_confs(&entries).await {
                Ok(()) => info!(count = entries.len(), "Registered pluggable transports"),
                Err(e) => warn!(error = %e, "Failed to register pluggable transports"),
            }
        });
    }

    fn push_bridges(&mut self) {
        let Some(control) = self.control.clone() else {
            return;
        };
        let resolver = BridgeResolver::new(&self.bridges, &self.config.builtin_bridges);
        info!(
            bridges = resolver.bridge_lines().len(),
            "Reconfiguring bridges on running Tor"
        );
        let steps = resolver.reconfiguration_steps();
        self.needs_reconfiguration = false;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = apply_steps(control.as_ref(), &steps).await;
            let _ = tx.send(Internal::BridgesPushed { result });
        });
    }

    fn bridges_pushed(&mut self, result: Result<()>) {
        match result {
            Ok(()) => info!("Bridges reconfigured"),
            Err(e) => {
                warn!(error = %e, "Bridge reconfiguration failed");
                // Tor still runs the old bridges; the next start retries.
                if self.engine.is_running() {
                    self.needs_reconfiguration = true;
                }
                self.emit(OnionEvent::Warning(format!("bridge reconfiguration failed: {e}")));
            }
        }
    }

    fn connect_control(&self) {
        let Some(control) = self.control.clone() else {
            return;
        };
        let generation = self.attempt;
        let config = self.config.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            if !control.is_connected() {
                if let Err(e) = control.connect().await {
                    warn!(error = %e, "Control port connection failed");
                }
            }

            let cookie = match config.read_cookie() {
                Ok(cookie) => cookie,
                Err(e) => {
                    warn!(error = %e, "Could not connect to Tor, no control cookie");
                    let _ = tx.send(Internal::CookieUnavailable { generation });
                    return;
                }
            };

            debug!(cookie = %RedactedBytes(&cookie), "Authenticating");
            if let Err(e) = control.authenticate(&cookie).await {
                warn!(error = %e, "Didn't connect to control port");
                return;
            }
            if tx.send(Internal::Authenticated { generation }).is_err() {
                return;
            }

            let established = control.circuit_established().await;
            let progress = control.bootstrap_progress().await;
            drop(control);
            forward_bootstrap(generation, established, progress, tx).await;
        });
    }

    fn authenticated(&mut self) {
        self.authenticated = true;
        if let Some(sinks) = self.sinks.as_mut() {
            sinks.ports_opened();
        }
        self.emit(OnionEvent::PortsOpened);
        self.register_transports();

        if std::mem::take(&mut self.push_after_auth)
            && self.needs_reconfiguration
            && self.engine.is_running()
        {
            self.push_bridges();
        }
    }

    fn circuit_established(&mut self) {
        info!("Connection established");
        self.set_state(LifecycleState::Connected);
        self.cancel_watchdog();
        let configuration = self.bridges.clone();
        if let Some(sinks) = self.sinks.as_mut() {
            sinks.finished(configuration.clone());
        }
        self.emit(OnionEvent::Finished(configuration));
    }

    fn arm_watchdog(&mut self) {
        self.watchdog += 1;
        self.watchdog_armed = true;
        self.schedule(
            Internal::WatchdogFired {
                generation: self.watchdog,
            },
            self.config.watchdog_delay,
        );
    }

    fn cancel_watchdog(&mut self) {
        self.watchdog += 1;
        self.watchdog_armed = false;
    }

    fn watchdog_fired(&mut self) {
        self.watchdog_armed = false;
        info!("Bootstrap stalled, restarting network");
        if let Some(control) = self.control.clone() {
            tokio::spawn(async move {
                for value in ["1", "0"] {
                    if let Err(e) = control.set_conf(DISABLE_NETWORK_KEY, value).await {
                        warn!(error = %e, value, "Failed to toggle DisableNetwork");
                    }
                }
            });
        }
        self.difficulty(OnionErrorKind::ConnectionDifficulty);
    }

    async fn stop(&mut self, done: oneshot::Sender<()>) {
        info!("Stopping Tor");
        if let Some(control) = self.control.take() {
            tokio::spawn(async move { control.disconnect().await });
        }
        self.authenticated = false;
        self.push_after_auth = false;
        self.sinks = None;
        self.cancel_watchdog();
        self.attempt += 1;
        self.launch += 1;
        self.reachability.stop();
        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
        let status = self.engine.cancel();
        self.set_state(LifecycleState::Stopped);

        match self.stopping.as_mut() {
            Some(stopping) => {
                if status.is_some() {
                    stopping.status = status;
                }
                stopping.waiters.push(done);
            }
            None => {
                self.stopping = Some(Stopping {
                    status,
                    waiters: vec![done],
                });
                self.schedule(Internal::StopPoll, self.config.stop_poll_interval);
            }
        }
    }

    fn poll_stop(&mut self) {
        let Some(stopping) = self.stopping.as_ref() else {
            return;
        };
        let exited = stopping
            .status
            .as_ref()
            .map_or(true, |status| status.is_finished() && !status.is_executing());
        if !exited {
            self.schedule(Internal::StopPoll, self.config.stop_poll_interval);
            return;
        }

        if let Some(stopping) = self.stopping.take() {
            if let Some(status) = &stopping.status {
                self.engine.clear_if(status);
            }
            info!("Tor stopped");
            for waiter in stopping.waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn reconnect(&self, reply: oneshot::Sender<()>) {
        let control = match self.control.clone() {
            Some(control) if self.engine.has_engine() => control,
            _ => {
                debug!("No Tor instance, ignoring reconnect");
                let _ = reply.send(());
                return;
            }
        };
        tokio::spawn(async move {
            reset_connection(control.as_ref()).await;
            let _ = reply.send(());
        });
    }

    fn network_changed(&mut self, snapshot: NetworkSnapshot) {
        self.network = snapshot;
        let Some(control) = self.control.clone() else {
            return;
        };
        let delta = network_change_delta(snapshot.is_ipv6_only(), self.bridges.uses_bridges());
        let reconnect = self.engine.has_engine();
        tokio::spawn(async move {
            if let Err(e) = control.set_confs(&delta).await {
                warn!(error = %e, "Failed to apply network policy");
            }
            if reconnect {
                reset_connection(control.as_ref()).await;
            }
        });
    }

    fn set_bridges(&mut self, configuration: BridgeConfiguration) -> bool {
        self.needs_reconfiguration = self.bridges.needs_reconfiguration(&configuration);
        debug!(
            bridges_type = ?configuration.bridges_type,
            needs_reconfiguration = self.needs_reconfiguration,
            "Bridge configuration updated"
        );
        self.bridges = configuration;
        self.needs_reconfiguration
    }

    async fn teardown(&mut self) {
        if let Some(control) = self.control.take() {
            control.disconnect().await;
        }
        self.reachability.stop();
        if let Some(transport) = self.transport.take() {
            transport.stop().await;
        }
        self.engine.cancel();
        info!("Onion manager shut down");
    }

    fn schedule(&self, message: Internal, delay: Duration) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        });
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Lifecycle state changed");
            self.state = state;
            self.emit(OnionEvent::StateChanged(state));
        }
    }

    fn difficulty(&mut self, kind: OnionErrorKind) {
        warn!(%kind, "Tor connection difficulty");
        if let Some(sinks) = &self.sinks {
            sinks.difficulty(kind);
        }
        self.emit(OnionEvent::Difficulty(kind));
    }

    fn emit(&self, event: OnionEvent) {
        let _ = self.events.send(event);
    }
}

async fn apply_steps<C: ControlChannel>(control: &C, steps: &[ConfStep]) -> Result<()> {
    for step in steps {
        match step {
            ConfStep::ResetConf(key) => control.reset_conf(key).await?,
            ConfStep::SetConfs(entries) => control.set_confs(entries).await?,
            ConfStep::SetConf(entry) => control.set_conf(&entry.key, &entry.value).await?,
        }
    }
    Ok(())
}

async fn reset_connection<C: ControlChannel>(control: &C) {
    info!("Tor reconnecting");
    match control.reset_connection().await {
        Ok(()) => info!("Tor reconnected"),
        Err(e) => warn!(error = %e, "Tor reconnect failed"),
    }
}

async fn forward_bootstrap(
    generation: u64,
    established: Result<oneshot::Receiver<bool>>,
    progress: Result<mpsc::UnboundedReceiver<u8>>,
    tx: mpsc::UnboundedSender<Internal>,
) {
    match established {
        Ok(established) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Ok(true) = established.await {
                    let _ = tx.send(Internal::CircuitEstablished { generation });
                }
            });
        }
        Err(e) => warn!(error = %e, "Failed to observe circuit establishment"),
    }

    match progress {
        Ok(mut progress) => {
            while let Some(progress) = progress.recv().await {
                if tx.send(Internal::Progress { generation, progress }).is_err() {
                    break;
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to observe bootstrap progress"),
    }
}

async fn launch_transport(
    config: &crate::config::TransportConfig,
    state_dir: PathBuf,
) -> Result<TransportProcess> {
    tokio::fs::create_dir_all(&state_dir).await?;
    TransportLauncher::launch(config, &state_dir).await
}
