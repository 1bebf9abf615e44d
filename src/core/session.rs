//! Telnet sessions
//!
//! A Telnet connection is only usable after a login handshake:
//!
//! `Dialing → Negotiating → AwaitingPassword → AwaitingReadyMarker → Authenticated → Closed`
//!
//! with `Failed` reachable from any state. Once authenticated, every command
//! is correlated with exactly one response terminated by the ready marker.
//! There is no background read task; the response is read by the sender.

use super::error::CommError;
use super::transport::telnet::{strip_echo, ScanError, TelnetReader, PASSWORD_PROMPT, READY_MARKER};
use super::transport::{dial, TelnetConfig, TransportError};
use parking_lot::RwLock;
use serde::Serialize;
use socket2::SockRef;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Telnet session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TelnetState {
    /// Opening the TCP connection
    Dialing,
    /// Skipping option offers
    Negotiating,
    /// Waiting for the password prompt
    AwaitingPassword,
    /// Login sent, waiting for the ready marker
    AwaitingReadyMarker,
    /// Ready for commands
    Authenticated,
    /// Torn down
    Closed,
    /// Handshake gave up
    Failed,
}

impl fmt::Display for TelnetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dialing => write!(f, "dialing"),
            Self::Negotiating => write!(f, "negotiating options"),
            Self::AwaitingPassword => write!(f, "awaiting password prompt"),
            Self::AwaitingReadyMarker => write!(f, "awaiting ready marker"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

type Progress<'a> = &'a (dyn Fn(TelnetState) -> bool + Sync);

enum ExchangeError {
    Write(io::Error),
    Read(io::Error),
    Timeout(String),
    Closed,
}

struct TelnetSession {
    io: AsyncMutex<Option<TelnetReader<TcpStream>>>,
    closed: CancellationToken,
    config: TelnetConfig,
}

impl TelnetSession {
    fn new(reader: TelnetReader<TcpStream>, config: TelnetConfig) -> Self {
        Self {
            io: AsyncMutex::new(Some(reader)),
            closed: CancellationToken::new(),
            config,
        }
    }

    /// Send one command and read its response
    async fn exchange(&self, id: &str, command: &str) -> Result<String, ExchangeError> {
        let mut guard = self.io.lock().await;
        let Some(io) = guard.as_mut() else {
            return Err(ExchangeError::Closed);
        };

        match io
            .drain_stale(self.config.drain_window(), self.config.drain_poll())
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!("[{}] discarded {} stale bytes", id, n),
            Err(e) => debug!("[{}] stale drain failed: {}", id, e),
        }

        io.write_line(command).await.map_err(ExchangeError::Write)?;
        debug!("[{}] Telnet command sent: '{}'", id, command);

        let raw = io
            .read_response(READY_MARKER, self.config.response_timeout())
            .await
            .map_err(|e| match e {
                ScanError::Timeout { partial, .. } => ExchangeError::Timeout(partial),
                ScanError::Io(e) => ExchangeError::Read(e),
            })?;

        Ok(strip_echo(&raw))
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(io) = self.io.lock().await.take() {
            abort(io.into_inner());
        }
    }
}

/// Close with zero linger so the device sees a reset instead of a FIN wait
fn abort(stream: TcpStream) {
    if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
        debug!("SO_LINGER not applied: {}", e);
    }
    drop(stream);
}

enum Slot {
    Handshaking { ticket: u64, state: TelnetState },
    Ready { ticket: u64, session: Arc<TelnetSession> },
}

#[derive(Default)]
struct Inner {
    slots: RwLock<HashMap<String, Slot>>,
    next_ticket: AtomicU64,
}

/// Registry of Telnet sessions, keyed by `host:port`
#[derive(Clone, Default)]
pub struct TelnetRegistry {
    inner: Arc<Inner>,
}

impl TelnetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` has an authenticated session
    pub fn is_connected(&self, id: &str) -> bool {
        matches!(self.inner.slots.read().get(id), Some(Slot::Ready { .. }))
    }

    /// Current state of `id`, if it is connected or connecting
    pub fn state(&self, id: &str) -> Option<TelnetState> {
        match self.inner.slots.read().get(id)? {
            Slot::Handshaking { state, .. } => Some(*state),
            Slot::Ready { .. } => Some(TelnetState::Authenticated),
        }
    }

    /// Ids of authenticated sessions
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready { .. }))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Dial `id` and run the login handshake, retrying per `config`.
    ///
    /// Returns `Ok` immediately if `id` is already connected or connecting.
    /// A disconnect issued while the handshake runs wins: the new socket is
    /// closed and `Connect` is returned.
    pub async fn connect(&self, id: &str, config: &TelnetConfig) -> Result<(), CommError> {
        let ticket = {
            let mut slots = self.inner.slots.write();
            if slots.contains_key(id) {
                debug!("Telnet {} already connected or connecting", id);
                return Ok(());
            }
            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            slots.insert(
                id.to_string(),
                Slot::Handshaking {
                    ticket,
                    state: TelnetState::Dialing,
                },
            );
            ticket
        };

        match self.handshake_with_retries(id, ticket, config).await {
            Ok(reader) => self.install(id, ticket, reader, config),
            Err(source) => {
                self.mark(id, ticket, TelnetState::Failed);
                self.forget(id, ticket);
                warn!("Telnet {} failed: {}", id, source);
                Err(CommError::connect(id, source))
            }
        }
    }

    async fn handshake_with_retries(
        &self,
        id: &str,
        ticket: u64,
        config: &TelnetConfig,
    ) -> Result<TelnetReader<TcpStream>, TransportError> {
        let attempts = config.attempts.max(1);
        let progress = |state: TelnetState| self.mark(id, ticket, state);
        let mut last_error = TransportError::Handshake("no attempt made".to_string());

        for attempt in 1..=attempts {
            if !progress(TelnetState::Dialing) {
                return Err(aborted());
            }
            info!("Telnet attempt #{} for {}", attempt, id);

            match handshake(id, config, &progress).await {
                Ok(reader) => return Ok(reader),
                Err(e) => {
                    warn!("[{}] attempt #{} failed: {}", id, attempt, e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(config.retry_backoff()).await;
            }
        }

        Err(last_error)
    }

    /// Record handshake progress; `false` once the placeholder is gone
    fn mark(&self, id: &str, ticket: u64, next: TelnetState) -> bool {
        match self.inner.slots.write().get_mut(id) {
            Some(Slot::Handshaking { ticket: t, state }) if *t == ticket => {
                debug!("Telnet {}: {} -> {}", id, state, next);
                *state = next;
                true
            }
            _ => false,
        }
    }

    fn forget(&self, id: &str, ticket: u64) {
        let mut slots = self.inner.slots.write();
        if matches!(slots.get(id), Some(Slot::Handshaking { ticket: t, .. }) if *t == ticket) {
            slots.remove(id);
        }
    }

    fn install(
        &self,
        id: &str,
        ticket: u64,
        reader: TelnetReader<TcpStream>,
        config: &TelnetConfig,
    ) -> Result<(), CommError> {
        let mut slots = self.inner.slots.write();
        let wanted =
            matches!(slots.get(id), Some(Slot::Handshaking { ticket: t, .. }) if *t == ticket);
        if !wanted {
            drop(slots);
            abort(reader.into_inner());
            warn!("Telnet {} was disconnected during its handshake", id);
            return Err(CommError::connect(id, aborted()));
        }

        let session = Arc::new(TelnetSession::new(reader, config.clone()));
        slots.insert(id.to_string(), Slot::Ready { ticket, session });
        info!("Telnet {} connected and authenticated", id);
        Ok(())
    }

    /// Tear down `id`. Succeeds if it is not connected; abandons a running
    /// handshake.
    pub async fn disconnect(&self, id: &str) -> Result<(), CommError> {
        let slot = self.inner.slots.write().remove(id);
        match slot {
            None => {}
            Some(Slot::Handshaking { state, .. }) => {
                info!("Telnet {} handshake abandoned while {}", id, state);
            }
            Some(Slot::Ready { session, .. }) => {
                session.close().await;
                info!("Telnet {} disconnected", id);
            }
        }
        Ok(())
    }

    /// Disconnect every session
    pub async fn disconnect_all(&self) -> Vec<CommError> {
        let ids: Vec<String> = self.inner.slots.read().keys().cloned().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Send `command` and return its correlated response.
    ///
    /// I/O failures tear the session down. A response that never reaches the
    /// ready marker is reported as `Protocol` with the partial text, and the
    /// session stays up.
    pub async fn send(&self, id: &str, command: &str) -> Result<String, CommError> {
        let Some((ticket, session)) = self.session(id) else {
            return Err(CommError::NotConnected(id.to_string()));
        };

        let outcome = tokio::select! {
            _ = session.closed.cancelled() => Err(ExchangeError::Closed),
            result = session.exchange(id, command) => result,
        };

        match outcome {
            Ok(reply) => {
                debug!("[{}] Telnet response received", id);
                Ok(reply)
            }
            Err(ExchangeError::Timeout(partial)) => Err(CommError::Protocol {
                id: id.to_string(),
                state: TelnetState::Authenticated,
                marker: READY_MARKER,
                partial,
            }),
            Err(ExchangeError::Closed) => Err(CommError::send(
                id,
                io::Error::new(io::ErrorKind::NotConnected, "session closed"),
            )),
            Err(ExchangeError::Write(e)) => {
                self.teardown(id, ticket).await;
                Err(CommError::send(id, e))
            }
            Err(ExchangeError::Read(e)) => {
                self.teardown(id, ticket).await;
                Err(CommError::Read {
                    id: id.to_string(),
                    source: e,
                })
            }
        }
    }

    fn session(&self, id: &str) -> Option<(u64, Arc<TelnetSession>)> {
        match self.inner.slots.read().get(id) {
            Some(Slot::Ready { ticket, session }) => Some((*ticket, Arc::clone(session))),
            _ => None,
        }
    }

    async fn teardown(&self, id: &str, ticket: u64) {
        let slot = {
            let mut slots = self.inner.slots.write();
            match slots.get(id) {
                Some(Slot::Ready { ticket: t, .. }) if *t == ticket => slots.remove(id),
                _ => None,
            }
        };

        if let Some(Slot::Ready { session, .. }) = slot {
            session.close().await;
            info!("Telnet {} torn down after I/O failure", id);
        }
    }
}

fn aborted() -> TransportError {
    TransportError::Aborted("disconnect requested during handshake".to_string())
}

fn handshake_error(state: TelnetState, err: ScanError) -> TransportError {
    match err {
        ScanError::Timeout { marker, window, .. } => TransportError::Handshake(format!(
            "{marker:?} not received within {window:?} while {state}"
        )),
        ScanError::Io(e) => TransportError::IoError(e),
    }
}

/// One handshake attempt, from dial to the ready marker
async fn handshake(
    id: &str,
    config: &TelnetConfig,
    progress: Progress<'_>,
) -> Result<TelnetReader<TcpStream>, TransportError> {
    let stream = dial(id, config.dial_timeout()).await?;
    stream.set_nodelay(true)?;
    let mut reader = TelnetReader::new(stream);

    if config.drain_banner {
        let discarded = reader
            .drain_stale(config.drain_window(), config.drain_poll())
            .await?;
        debug!("[{}] discarded {} banner bytes", id, discarded);
    }

    progress(TelnetState::Negotiating);
    reader.skip_negotiation(config.negotiation_timeout()).await?;

    progress(TelnetState::AwaitingPassword);
    reader
        .read_until(PASSWORD_PROMPT, config.marker_timeout())
        .await
        .map_err(|e| handshake_error(TelnetState::AwaitingPassword, e))?;
    reader.write_line(&config.password).await?;

    progress(TelnetState::AwaitingReadyMarker);
    reader
        .read_until(READY_MARKER, config.marker_timeout())
        .await
        .map_err(|e| handshake_error(TelnetState::AwaitingReadyMarker, e))?;

    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::telnet::IAC;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn fast_config() -> TelnetConfig {
        TelnetConfig {
            dial_timeout_ms: 1_000,
            negotiation_timeout_ms: 100,
            marker_timeout_ms: 500,
            retry_backoff_ms: 20,
            response_timeout_ms: 2_000,
            drain_window_ms: 100,
            drain_poll_ms: 20,
            ..TelnetConfig::default()
        }
    }

    async fn serve_device(
        mut stream: TcpStream,
        prompt_delay: Duration,
        hang_up: bool,
    ) -> io::Result<()> {
        stream.write_all(&[IAC, 253, 1, IAC, 251, 3]).await?;
        tokio::time::sleep(prompt_delay).await;
        stream.write_all(b"Controller v2\r\nPassword: ").await?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        if lines.next_line().await?.as_deref() != Some("Help") {
            return Ok(());
        }
        write_half.write_all(b"Welcome\r\nGPL:").await?;
        if hang_up {
            return Ok(());
        }

        while let Some(command) = lines.next_line().await? {
            match command.as_str() {
                "echo" => {
                    write_half.write_all(b"echo\r\nresultline\r\nGP").await?;
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    write_half.write_all(b"L:").await?;
                }
                "slow" => write_half.write_all(b"slow\r\npartial").await?,
                other => {
                    let reply = format!("{other}\r\nok {other}\r\nGPL:");
                    write_half.write_all(reply.as_bytes()).await?;
                }
            }
        }
        Ok(())
    }

    async fn spawn_device(prompt_delay: Duration, hang_up: bool) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_device(stream, prompt_delay, hang_up));
            }
        });
        (addr, accepts)
    }

    async fn spawn_silent_device() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepts)
    }

    #[tokio::test]
    async fn test_handshake_and_correlated_response() {
        let (addr, _) = spawn_device(Duration::ZERO, false).await;
        let registry = TelnetRegistry::new();

        registry.connect(&addr, &fast_config()).await.unwrap();
        assert_eq!(registry.state(&addr), Some(TelnetState::Authenticated));

        assert_eq!(registry.send(&addr, "echo").await.unwrap(), "resultline");
        assert_eq!(registry.send(&addr, "STATUS").await.unwrap(), "ok STATUS");
    }

    #[tokio::test]
    async fn test_second_connect_is_noop() {
        let (addr, accepts) = spawn_device(Duration::ZERO, false).await;
        let registry = TelnetRegistry::new();

        registry.connect(&addr, &fast_config()).await.unwrap();
        registry.connect(&addr, &fast_config()).await.unwrap();
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ids(), vec![addr]);
    }

    #[tokio::test]
    async fn test_missing_password_prompt_exhausts_retries() {
        let (addr, accepts) = spawn_silent_device().await;
        let registry = TelnetRegistry::new();
        let config = TelnetConfig {
            marker_timeout_ms: 200,
            ..fast_config()
        };

        let result = registry.connect(&addr, &config).await;
        assert!(matches!(result, Err(CommError::Connect { .. })));
        assert!(!registry.is_connected(&addr));
        assert_eq!(registry.state(&addr), None);
        assert_eq!(accepts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_wins() {
        let (addr, _) = spawn_device(Duration::from_millis(300), false).await;
        let registry = TelnetRegistry::new();

        let connecting = {
            let registry = registry.clone();
            let addr = addr.clone();
            tokio::spawn(async move { registry.connect(&addr, &fast_config()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = registry.state(&addr);
        assert!(state.is_some() && state != Some(TelnetState::Authenticated));
        registry.disconnect(&addr).await.unwrap();

        let result = connecting.await.unwrap();
        assert!(matches!(
            result,
            Err(CommError::Connect {
                source: TransportError::Aborted(_),
                ..
            })
        ));
        assert!(!registry.is_connected(&addr));
    }

    #[tokio::test]
    async fn test_response_timeout_keeps_session() {
        let (addr, _) = spawn_device(Duration::ZERO, false).await;
        let registry = TelnetRegistry::new();
        let config = TelnetConfig {
            response_timeout_ms: 300,
            ..fast_config()
        };
        registry.connect(&addr, &config).await.unwrap();

        let result = registry.send(&addr, "slow").await;
        assert!(matches!(
            result,
            Err(CommError::Protocol { ref partial, .. }) if partial.contains("partial")
        ));
        assert!(registry.is_connected(&addr));
        assert_eq!(registry.send(&addr, "PING").await.unwrap(), "ok PING");
    }

    #[tokio::test]
    async fn test_peer_hang_up_tears_session_down() {
        let (addr, _) = spawn_device(Duration::ZERO, true).await;
        let registry = TelnetRegistry::new();
        registry.connect(&addr, &fast_config()).await.unwrap();

        let result = registry.send(&addr, "STATUS").await;
        assert!(matches!(
            result,
            Err(CommError::Read { .. } | CommError::Send { .. })
        ));
        assert!(!registry.is_connected(&addr));
    }

    #[tokio::test]
    async fn test_disconnect_resets_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            stream.write_all(&[IAC, 251, 1]).await?;
            stream.write_all(b"Password: ").await?;

            let mut reader = BufReader::new(stream);
            let mut login = String::new();
            reader.read_line(&mut login).await?;
            assert_eq!(login, "Help\r\n");
            reader.get_mut().write_all(b"Welcome\r\nGPL:").await?;

            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await
        });

        let registry = TelnetRegistry::new();
        registry.connect(&addr, &fast_config()).await.unwrap();
        assert_eq!(registry.state(&addr), Some(TelnetState::Authenticated));
        registry.disconnect(&addr).await.unwrap();
        assert!(!registry.is_connected(&addr));

        let read = tokio::time::timeout(Duration::from_secs(2), device)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_disconnect_idempotent_and_send_unknown() {
        let registry = TelnetRegistry::new();
        assert!(registry.disconnect("10.1.1.1:23").await.is_ok());
        assert!(matches!(
            registry.send("10.1.1.1:23", "x").await,
            Err(CommError::NotConnected(_))
        ));
    }
}
