//! Tor ControlPort client implementation.
//!
//! Communicates with Tor via the ControlPort protocol.
//! A background reader task splits the incoming stream into synchronous
//! replies, matched to commands in the order they were sent, and `650`
//! asynchronous events, which feed the circuit and bootstrap watchers.

use super::events::{parse_circuit_status, Circuit, Reply, ReplyLine, StatusEvent, EVENT_CODE};
use super::{ConfEntry, ControlChannel};
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `disconnect` waits for Tor to acknowledge `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default limit for connecting and for each command reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Tor ControlPort session.
///
/// The session object outlives individual connections: it can be connected,
/// disconnected and connected again.
pub struct ControlSession {
    addr: SocketAddr,
    reply_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Connection>>,
    shared: Arc<Shared>,
}

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// State shared with the reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<VecDeque<oneshot::Sender<Result<Reply>>>>,
    circuit_watchers: Mutex<Vec<oneshot::Sender<bool>>>,
    progress_watchers: Mutex<Vec<mpsc::UnboundedSender<u8>>>,
    connected: AtomicBool,
    authenticated: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn complete(&self, reply: Reply) {
        match lock(&self.pending).pop_front() {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
            }
            None => warn!(code = reply.code, "Unsolicited control port reply"),
        }
    }

    fn dispatch_event(&self, lines: &[String]) {
        let Some(event) = lines.first().and_then(|line| StatusEvent::parse(line)) else {
            return;
        };

        if event.is_circuit_established() {
            self.notify_circuit_established();
        }

        if let Some(progress) = event.bootstrap_progress() {
            self.notify_progress(progress);
        }
    }

    fn notify_circuit_established(&self) {
        let watchers = std::mem::take(&mut *lock(&self.circuit_watchers));
        for watcher in watchers {
            let _ = watcher.send(true);
        }
    }

    fn notify_progress(&self, progress: u8) {
        debug!(progress, "Bootstrap progress");
        lock(&self.progress_watchers)
            .retain(|watcher| watcher.send(progress).is_ok() && progress < 100);
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        for tx in lock(&self.pending).drain(..) {
            let _ = tx.send(Err(Error::Control("connection closed".into())));
        }
        lock(&self.circuit_watchers).clear();
        lock(&self.progress_watchers).clear();
    }
}

impl ControlSession {
    /// Create a session for the control port at `addr`. Does not connect.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            connection: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Limit connecting and every command reply to `timeout`.
    ///
    /// A command that times out closes the connection, since later replies
    /// could no longer be matched to their commands.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Control port address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether `AUTHENTICATE` succeeded on the current connection.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Connect to the control port.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.is_connected() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.reply_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| {
                Error::Control(format!("failed to connect to control port {}: {}", self.addr, e))
            })?;

        let (read_half, write_half) = stream.into_split();
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            read_loop(BufReader::new(read_half), shared.clone()).await;
            shared.close();
        });

        if let Some(old) = connection.replace(Connection {
            writer: write_half,
            reader,
        }) {
            old.reader.abort();
        }

        debug!(addr = %self.addr, "Connected to control port");
        Ok(())
    }

    /// Send a command and wait for its reply.
    async fn command(&self, cmd: &str) -> Result<Reply> {
        let rx = {
            let mut connection = self.connection.lock().await;
            let connection = connection
                .as_mut()
                .ok_or_else(|| Error::Control("not connected".into()))?;

            let (tx, rx) = oneshot::channel();
            lock(&self.shared.pending).push_back(tx);

            let write = async {
                connection
                    .writer
                    .write_all(format!("{}\r\n", cmd).as_bytes())
                    .await?;
                connection.writer.flush().await
            };
            if let Err(e) = write.await {
                lock(&self.shared.pending).pop_back();
                return Err(Error::Control(format!("failed to send command: {}", e)));
            }
            rx
        };

        let reply = match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| Error::Control("connection closed".into()))??,
            Err(_) => {
                warn!(command = %command_name(cmd), "Control port reply timed out");
                self.drop_connection().await;
                return Err(Error::Timeout);
            }
        };

        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(Error::Control(format!(
                "{} {}",
                reply.code,
                reply.lines.join(" ")
            )))
        }
    }

    /// Authenticate with the control cookie, then subscribe to status events.
    pub async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        debug!(cookie = %RedactedBytes(cookie), "Authenticating with control port");

        self.command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
            .await
            .map_err(|e| match e {
                Error::Control(msg) => Error::Auth(msg),
                other => other,
            })?;
        self.shared.authenticated.store(true, Ordering::SeqCst);

        self.command("SETEVENTS STATUS_CLIENT").await?;

        info!("Authenticated with Tor control port");
        Ok(())
    }

    /// Receiver fired once when a circuit is established.
    ///
    /// Also checks `status/circuit-established` so a circuit built before
    /// the call is not missed.
    pub async fn circuit_established(&self) -> Result<oneshot::Receiver<bool>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.circuit_watchers).push(tx);

        match self.command("GETINFO status/circuit-established").await {
            Ok(reply) if reply.value("status/circuit-established") == Some("1") => {
                self.shared.notify_circuit_established();
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Could not query circuit status"),
        }

        Ok(rx)
    }

    /// Receiver of bootstrap progress values, closed once 100 is delivered.
    ///
    /// The current phase is delivered first.
    pub async fn bootstrap_progress(&self) -> Result<mpsc::UnboundedReceiver<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.progress_watchers).push(tx);

        match self.command("GETINFO status/bootstrap-phase").await {
            Ok(reply) => {
                let current = reply
                    .value("status/bootstrap-phase")
                    .and_then(|phase| StatusEvent::parse(&format!("STATUS_CLIENT {}", phase)))
                    .and_then(|event| event.bootstrap_progress());
                if let Some(progress) = current {
                    self.shared.notify_progress(progress);
                }
            }
            Err(e) => debug!(error = %e, "Could not query bootstrap phase"),
        }

        Ok(rx)
    }

    /// `SETCONF key=value`.
    pub async fn set_conf(&self, key: &str, value: &str) -> Result<()> {
        self.set_confs(&[ConfEntry::new(key, value)]).await
    }

    /// `SETCONF` with several entries.
    pub async fn set_confs(&self, entries: &[ConfEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let body = entries
            .iter()
            .map(ConfEntry::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        self.command(&format!("SETCONF {}", body)).await?;
        debug!(keys = ?entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), "Configuration set");
        Ok(())
    }

    /// `RESETCONF key`.
    pub async fn reset_conf(&self, key: &str) -> Result<()> {
        self.command(&format!("RESETCONF {}", key)).await?;
        debug!(key, "Configuration reset");
        Ok(())
    }

    /// Signal Tor (e.g., NEWNYM for new circuits).
    pub async fn signal(&self, signal: &str) -> Result<()> {
        self.command(&format!("SIGNAL {}", signal)).await?;
        Ok(())
    }

    /// Reload configuration and switch to clean circuits.
    pub async fn reset_connection(&self) -> Result<()> {
        self.signal("RELOAD").await?;
        self.signal("NEWNYM").await?;
        info!("Tor connection reset");
        Ok(())
    }

    /// Fully built circuits.
    pub async fn circuits(&self) -> Result<Vec<Circuit>> {
        let reply = self.command("GETINFO circuit-status").await?;
        let lines: Vec<String> = reply
            .lines
            .iter()
            .filter(|line| line.as_str() != "OK")
            .map(|line| {
                line.strip_prefix("circuit-status=")
                    .unwrap_or(line)
                    .to_string()
            })
            .collect();
        Ok(parse_circuit_status(&lines)
            .into_iter()
            .filter(Circuit::is_built)
            .collect())
    }

    /// Close circuits by id.
    pub async fn close_circuits(&self, ids: &[String]) -> Result<bool> {
        let mut all_closed = true;
        for id in ids {
            if let Err(e) = self.command(&format!("CLOSECIRCUIT {}", id)).await {
                warn!(circuit = %id, error = %e, "Failed to close circuit");
                all_closed = false;
            }
        }
        Ok(all_closed)
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        if self.is_connected() {
            let _ = tokio::time::timeout(QUIT_TIMEOUT, self.command("QUIT")).await;
        }
        self.drop_connection().await;
        debug!("Disconnected from control port");
    }

    async fn drop_connection(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.writer.shutdown().await;
            connection.reader.abort();
        }
        self.shared.close();
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        if let Ok(mut connection) = self.connection.try_lock() {
            if let Some(connection) = connection.take() {
                connection.reader.abort();
            }
        }
    }
}

/// Command keyword only; arguments may carry the cookie.
fn command_name(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or("")
}

/// Read one line, without the trailing CRLF. `None` at EOF.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_loop<R: AsyncBufRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    let mut lines: Vec<String> = Vec::new();
    'outer: loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Control port read failed");
                break;
            }
        };

        if line.is_empty() {
            continue;
        }

        let Some(parsed) = ReplyLine::parse(&line) else {
            warn!("Malformed control port line");
            continue;
        };
        lines.push(parsed.text.to_string());

        if parsed.has_data() {
            loop {
                match read_line(&mut reader).await {
                    Ok(Some(data)) if data == "." => break,
                    Ok(Some(data)) => {
                        let data = match data.strip_prefix("..") {
                            Some(rest) => format!(".{}", rest),
                            None => data,
                        };
                        lines.push(data);
                    }
                    Ok(None) | Err(_) => break 'outer,
                }
            }
        }

        if parsed.is_final() {
            let reply_lines = std::mem::take(&mut lines);
            if parsed.code == EVENT_CODE {
                shared.dispatch_event(&reply_lines);
            } else {
                shared.complete(Reply {
                    code: parsed.code,
                    lines: reply_lines,
                });
            }
        }
    }
}

impl ControlChannel for ControlSession {
    fn is_connected(&self) -> bool {
        ControlSession::is_connected(self)
    }

    async fn connect(&self) -> Result<()> {
        ControlSession::connect(self).await
    }

    async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        ControlSession::authenticate(self, cookie).await
    }

    async fn circuit_established(&self) -> Result<oneshot::Receiver<bool>> {
        ControlSession::circuit_established(self).await
    }

    async fn bootstrap_progress(&self) -> Result<mpsc::UnboundedReceiver<u8>> {
        ControlSession::bootstrap_progress(self).await
    }

    async fn set_conf(&self, key: &str, value: &str) -> Result<()> {
        ControlSession::set_conf(self, key, value).await
    }

    async fn set_confs(&self, entries: &[ConfEntry]) -> Result<()> {
        ControlSession::set_confs(self, entries).await
    }

    async fn reset_conf(&self, key: &str) -> Result<()> {
        ControlSession::reset_conf(self, key).await
    }

    async fn reset_connection(&self) -> Result<()> {
        ControlSession::reset_connection(self).await
    }

    async fn circuits(&self) -> Result<Vec<Circuit>> {
        ControlSession::circuits(self).await
    }

    async fn close_circuits(&self, ids: &[String]) -> Result<bool> {
        ControlSession::close_circuits(self, ids).await
    }

    async fn disconnect(&self) {
        ControlSession::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_reply_slot() -> (Arc<Shared>, oneshot::Receiver<Result<Reply>>) {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending).push_back(tx);
        (shared, rx)
    }

    #[tokio::test]
    async fn test_read_loop_multiline_reply() {
        let (shared, rx) = shared_with_reply_slot();
        let input: &[u8] = b"250-version=0.4.8.9\r\n250 OK\r\n";
        read_loop(input, shared).await;
        let reply = rx.await.expect("reply sent").expect("reply ok");
        assert_eq!(reply.code, 250);
        assert_eq!(reply.value("version"), Some("0.4.8.9"));
    }

    #[tokio::test]
    async fn test_read_loop_data_block() {
        let (shared, rx) = shared_with_reply_slot();
        let input: &[u8] =
            b"250+circuit-status=\r\n1 BUILT $AAAA~a\r\n..dotted\r\n.\r\n250 OK\r\n";
        read_loop(input, shared).await;
        let reply = rx.await.expect("reply sent").expect("reply ok");
        assert_eq!(
            reply.lines,
            vec!["circuit-status=", "1 BUILT $AAAA~a", ".dotted", "OK"]
        );
    }

    #[tokio::test]
    async fn test_events_do_not_consume_replies() {
        let (shared, mut rx) = shared_with_reply_slot();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        lock(&shared.progress_watchers).push(progress_tx);

        let input: &[u8] = b"650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=30 TAG=x SUMMARY=\"y\"\r\n";
        read_loop(input, shared.clone()).await;

        assert_eq!(progress_rx.recv().await, Some(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_progress_watcher_closed_at_100() {
        let shared = Shared::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&shared.progress_watchers).push(tx);

        shared.notify_progress(90);
        shared.notify_progress(100);
        shared.notify_progress(100);

        assert_eq!(rx.try_recv().ok(), Some(90));
        assert_eq!(rx.try_recv().ok(), Some(100));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_circuit_watchers_fire_once() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        lock(&shared.circuit_watchers).push(tx);

        shared.dispatch_event(&["STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED".to_string()]);
        assert_eq!(rx.try_recv().ok(), Some(true));
        assert!(lock(&shared.circuit_watchers).is_empty());
    }

    #[test]
    fn test_command_name_hides_arguments() {
        assert_eq!(command_name("AUTHENTICATE abcdef"), "AUTHENTICATE");
        assert_eq!(command_name("QUIT"), "QUIT");
    }

    #[test]
    fn test_close_fails_pending_replies() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        lock(&shared.pending).push_back(tx);
        shared.connected.store(true, Ordering::SeqCst);

        shared.close();
        assert!(!shared.connected.load(Ordering::SeqCst));
        assert!(matches!(rx.try_recv(), Ok(Err(Error::Control(_)))));
    }
}
