//! Host connectivity observation.
//!
//! A [`NetworkProbe`] reports which address families currently have a
//! route. [`ReachabilityMonitor`] re-probes whenever the system reports a
//! link, address or route change, and on a fixed interval where no such
//! notifications exist. Every change is reported, which the lifecycle
//! manager turns into an IPv4/IPv6 policy update followed by a reconnect.

mod netlink;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Wait after a notification before probing, so a burst settles first.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Local addresses selected for outbound IPv4 and IPv6 traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkSnapshot {
    /// Source address for IPv4 traffic, if routable.
    pub ipv4: Option<IpAddr>,
    /// Source address for IPv6 traffic, if routable.
    pub ipv6: Option<IpAddr>,
}

/// Address-family classification of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Status {
    /// IPv4 only.
    Ipv4Only,
    /// IPv6 only.
    Ipv6Only,
    /// Both families routable.
    DualStack,
    /// Nothing routable.
    Offline,
}

impl NetworkSnapshot {
    /// Classify the snapshot.
    pub fn ipv6_status(&self) -> Ipv6Status {
        match (self.ipv4.is_some(), self.ipv6.is_some()) {
            (true, true) => Ipv6Status::DualStack,
            (true, false) => Ipv6Status::Ipv4Only,
            (false, true) => Ipv6Status::Ipv6Only,
            (false, false) => Ipv6Status::Offline,
        }
    }

    /// The host can only reach the network over IPv6.
    pub fn is_ipv6_only(&self) -> bool {
        self.ipv6_status() == Ipv6Status::Ipv6Only
    }
}

/// Source of connectivity snapshots.
pub trait NetworkProbe: Send + Sync {
    /// Take a snapshot. Must not block for long.
    fn probe(&self) -> io::Result<NetworkSnapshot>;
}

/// Probe based on UDP route lookups.
///
/// Connecting a UDP socket selects a route and a source address without
/// sending anything.
#[derive(Debug, Clone, Copy)]
pub struct RouteProbe {
    ipv4_target: SocketAddr,
    ipv6_target: SocketAddr,
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self {
            ipv4_target: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            ipv6_target: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
                53,
            ),
        }
    }
}

impl RouteProbe {
    /// Probe routes towards custom targets.
    pub fn new(ipv4_target: SocketAddr, ipv6_target: SocketAddr) -> Self {
        Self {
            ipv4_target,
            ipv6_target,
        }
    }
}

fn route_source(target: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

impl NetworkProbe for RouteProbe {
    fn probe(&self) -> io::Result<NetworkSnapshot> {
        Ok(NetworkSnapshot {
            ipv4: route_source(self.ipv4_target),
            ipv6: route_source(self.ipv6_target),
        })
    }
}

/// Wake-ups from the system when links, addresses or routes change.
#[derive(Debug)]
pub struct ChangeNotifications {
    rx: mpsc::UnboundedReceiver<()>,
    task: Option<JoinHandle<()>>,
}

impl ChangeNotifications {
    /// Subscribe to the host's network notifications.
    ///
    /// Uses rtnetlink on Linux and fails with `Unsupported` elsewhere.
    pub fn system() -> io::Result<Self> {
        let (rx, task) = netlink::subscribe()?;
        Ok(Self {
            rx,
            task: Some(task),
        })
    }

    /// Notifications fed by hand through the returned sender.
    pub fn channel() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, task: None })
    }

    /// Discard notifications that are already queued.
    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for ChangeNotifications {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn next_change(notifications: &mut Option<ChangeNotifications>) -> Option<()> {
    match notifications {
        Some(notifications) => notifications.rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Tick,
    Notified,
    Closed,
}

/// Probe loop driven by change notifications and a fallback interval.
#[derive(Debug, Default)]
pub struct ReachabilityMonitor {
    task: Option<JoinHandle<()>>,
}

impl ReachabilityMonitor {
    /// Create a stopped monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start observation and return the initial snapshot.
    ///
    /// Subscribes to the system's change notifications when available and
    /// polls every `interval` either way. `on_change` is called with every
    /// snapshot that differs from the previous one; returning `false` ends
    /// observation.
    pub fn start<F>(
        &mut self,
        probe: Arc<dyn NetworkProbe>,
        interval: Duration,
        on_change: F,
    ) -> io::Result<NetworkSnapshot>
    where
        F: FnMut(NetworkSnapshot) -> bool + Send + 'static,
    {
        self.stop();
        let notifications = match ChangeNotifications::system() {
            Ok(notifications) => Some(notifications),
            Err(e) => {
                debug!(error = %e, "Network change notifications unavailable, polling only");
                None
            }
        };
        self.start_with(probe, interval, notifications, on_change)
    }

    /// Like [`start`](Self::start) with an explicit notification source.
    pub fn start_with<F>(
        &mut self,
        probe: Arc<dyn NetworkProbe>,
        interval: Duration,
        mut notifications: Option<ChangeNotifications>,
        mut on_change: F,
    ) -> io::Result<NetworkSnapshot>
    where
        F: FnMut(NetworkSnapshot) -> bool + Send + 'static,
    {
        self.stop();
        let initial = probe.probe()?;
        info!(
            status = ?initial.ipv6_status(),
            notifications = notifications.is_some(),
            "Reachability observation started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut last = initial;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                let wake = tokio::select! {
                    _ = ticker.tick() => Wake::Tick,
                    changed = next_change(&mut notifications) => match changed {
                        Some(()) => Wake::Notified,
                        None => Wake::Closed,
                    },
                };
                match wake {
                    Wake::Tick => {}
                    Wake::Notified => {
                        tokio::time::sleep(SETTLE_DELAY).await;
                        if let Some(notifications) = notifications.as_mut() {
                            notifications.drain();
                        }
                    }
                    Wake::Closed => {
                        debug!("Network change notifications ended, polling only");
                        notifications = None;
                        continue;
                    }
                }
                match probe.probe() {
                    Ok(snapshot) if snapshot != last => {
                        info!(status = ?snapshot.ipv6_status(), "Network changed");
                        last = snapshot;
                        if !on_change(snapshot) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Reachability probe failed"),
                }
            }
        }));
        Ok(initial)
    }

    /// Stop observation.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Observation is active.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeProbe(Mutex<io::Result<NetworkSnapshot>>);

    impl FakeProbe {
        fn new(snapshot: NetworkSnapshot) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(snapshot))))
        }

        fn set(&self, result: io::Result<NetworkSnapshot>) {
            *self.0.lock().expect("lock") = result;
        }
    }

    impl NetworkProbe for FakeProbe {
        fn probe(&self) -> io::Result<NetworkSnapshot> {
            match &*self.0.lock().expect("lock") {
                Ok(snapshot) => Ok(*snapshot),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn dual_stack() -> NetworkSnapshot {
        NetworkSnapshot {
            ipv4: Some("192.0.2.10".parse().expect("ip")),
            ipv6: Some("2001:db8::10".parse().expect("ip")),
        }
    }

    fn ipv6_only() -> NetworkSnapshot {
        NetworkSnapshot {
            ipv4: None,
            ipv6: Some("2001:db8::10".parse().expect("ip")),
        }
    }

    #[test]
    fn test_ipv6_status() {
        assert_eq!(dual_stack().ipv6_status(), Ipv6Status::DualStack);
        assert_eq!(ipv6_only().ipv6_status(), Ipv6Status::Ipv6Only);
        assert!(ipv6_only().is_ipv6_only());
        assert_eq!(NetworkSnapshot::default().ipv6_status(), Ipv6Status::Offline);
        let v4 = NetworkSnapshot {
            ipv4: Some("192.0.2.10".parse().expect("ip")),
            ipv6: None,
        };
        assert_eq!(v4.ipv6_status(), Ipv6Status::Ipv4Only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_changes_only() {
        let probe = FakeProbe::new(dual_stack());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReachabilityMonitor::new();
        let initial = monitor
            .start(probe.clone(), Duration::from_secs(10), move |s| tx.send(s).is_ok())
            .expect("start");
        assert_eq!(initial, dual_stack());

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(rx.try_recv().is_err());

        probe.set(Ok(ipv6_only()));
        let changed = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("change reported")
            .expect("channel open");
        assert_eq!(changed, ipv6_only());
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_skipped() {
        let probe = FakeProbe::new(dual_stack());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = ReachabilityMonitor::new();
        monitor
            .start(probe.clone(), Duration::from_secs(10), move |s| tx.send(s).is_ok())
            .expect("start");

        probe.set(Err(io::Error::new(io::ErrorKind::Other, "no route")));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(rx.try_recv().is_err());

        probe.set(Ok(NetworkSnapshot::default()));
        let changed = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("change reported")
            .expect("channel open");
        assert_eq!(changed.ipv6_status(), Ipv6Status::Offline);
    }

    #[tokio::test]
    async fn test_start_fails_with_initial_probe() {
        let probe = FakeProbe::new(dual_stack());
        probe.set(Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")));
        let mut monitor = ReachabilityMonitor::new();
        let result = monitor.start(probe, Duration::from_secs(10), |_| true);
        assert!(result.is_err());
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_restart_replaces_task() {
        let probe = FakeProbe::new(dual_stack());
        let mut monitor = ReachabilityMonitor::new();
        monitor
            .start(probe.clone(), Duration::from_secs(10), |_| true)
            .expect("start");
        monitor
            .start(probe, Duration::from_secs(10), |_| true)
            .expect("restart");
        assert!(monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_probes_before_interval() {
        let probe = FakeProbe::new(dual_stack());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (notify, notifications) = ChangeNotifications::channel();
        let mut monitor = ReachabilityMonitor::new();
        monitor
            .start_with(
                probe.clone(),
                Duration::from_secs(3600),
                Some(notifications),
                move |s| tx.send(s).is_ok(),
            )
            .expect("start");

        probe.set(Ok(ipv6_only()));
        notify.send(()).expect("monitor alive");
        let changed = tokio::time::timeout(SETTLE_DELAY * 2, rx.recv())
            .await
            .expect("change reported")
            .expect("channel open");
        assert_eq!(changed, ipv6_only());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_burst_probes_once() {
        let probe = FakeProbe::new(dual_stack());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (notify, notifications) = ChangeNotifications::channel();
        let mut monitor = ReachabilityMonitor::new();
        monitor
            .start_with(
                probe.clone(),
                Duration::from_secs(3600),
                Some(notifications),
                move |s| tx.send(s).is_ok(),
            )
            .expect("start");

        probe.set(Ok(ipv6_only()));
        for _ in 0..5 {
            notify.send(()).expect("monitor alive");
        }
        tokio::time::sleep(SETTLE_DELAY * 4).await;
        assert_eq!(rx.try_recv().ok(), Some(ipv6_only()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_notifications_fall_back_to_polling() {
        let probe = FakeProbe::new(dual_stack());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (notify, notifications) = ChangeNotifications::channel();
        let mut monitor = ReachabilityMonitor::new();
        monitor
            .start_with(
                probe.clone(),
                Duration::from_secs(10),
                Some(notifications),
                move |s| tx.send(s).is_ok(),
            )
            .expect("start");

        drop(notify);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.is_running());

        probe.set(Ok(ipv6_only()));
        let changed = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("change reported")
            .expect("channel open");
        assert_eq!(changed, ipv6_only());
    }

    #[test]
    fn test_route_probe_never_fails() {
        assert!(RouteProbe::default().probe().is_ok());
    }
}
