//! Composition root
//!
//! The [`Hub`] owns one registry per transport kind and the journal. Front
//! ends construct one and route every call through it.

use super::error::CommError;
use super::event::{self, EventSink, InboundEvent};
use super::logger::{daily_log_path, LogBook, LogError, LogTag};
use super::registry::{SerialRegistry, TcpRegistry};
use super::session::TelnetRegistry;
use super::transport::{
    self, SerialOpener, TcpOpener, Transport, TransportError, TransportKind,
};
use crate::config::AppConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registries, journal and the event tap
pub struct Hub {
    config: AppConfig,
    serial: SerialRegistry,
    tcp: TcpRegistry,
    telnet: TelnetRegistry,
    journal: Arc<LogBook>,
    kinds: RwLock<HashMap<String, TransportKind>>,
    events: EventSink,
}

impl Hub {
    /// Build a hub from `config`. Returns the receiver every inbound event is
    /// forwarded to after it has been journaled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AppConfig) -> (Self, mpsc::Receiver<InboundEvent>) {
        let capacity = config.registry.event_capacity.max(1);
        let (events, raw) = event::channel(capacity);
        let (forward, out) = event::channel(capacity);

        let journal = Arc::new(LogBook::new(config.logging.queue_capacity));
        tokio::spawn(tap(
            raw,
            forward,
            Arc::clone(&journal),
            config.logging.channel.clone(),
        ));

        let read = config.registry.registry_config();
        let hub = Self {
            serial: SerialRegistry::with_config(SerialOpener, read.clone()),
            tcp: TcpRegistry::with_config(TcpOpener, read),
            telnet: TelnetRegistry::new(),
            journal,
            kinds: RwLock::new(HashMap::new()),
            events,
            config,
        };
        (hub, out)
    }

    /// Active configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Serial registry
    pub fn serial(&self) -> &SerialRegistry {
        &self.serial
    }

    /// TCP registry
    pub fn tcp(&self) -> &TcpRegistry {
        &self.tcp
    }

    /// Telnet registry
    pub fn telnet(&self) -> &TelnetRegistry {
        &self.telnet
    }

    /// Kind `id` was connected with, if it is still tracked
    pub fn kind_of(&self, id: &str) -> Option<TransportKind> {
        self.kinds.read().get(id).copied()
    }

    /// Whether `id` is live in its registry
    pub fn is_connected(&self, id: &str) -> bool {
        match self.kind_of(id) {
            Some(TransportKind::Serial) => self.serial.is_connected(id),
            Some(TransportKind::Tcp) => self.tcp.is_connected(id),
            Some(TransportKind::Telnet) => self.telnet.is_connected(id),
            None => false,
        }
    }

    /// Connect `id` over `transport`.
    ///
    /// Fails if `id` is live under another transport kind.
    pub async fn connect(&self, id: &str, transport: &Transport) -> Result<(), CommError> {
        if let Some(kind) = self.kind_of(id) {
            if kind != transport.kind() && self.is_connected(id) {
                let err = CommError::connect(
                    id,
                    TransportError::ConnectionFailed(format!("already connected as {kind}")),
                );
                self.note(LogTag::Erro, id, &err.to_string());
                return Err(err);
            }
        }

        let result = match transport {
            Transport::Serial(params) => self.serial.connect(id, params, self.events.clone()).await,
            Transport::Tcp(params) => self.tcp.connect(id, params, self.events.clone()).await,
            Transport::Telnet(params) => self.telnet.connect(id, params).await,
        };

        match &result {
            Ok(()) => {
                self.kinds.write().insert(id.to_string(), transport.kind());
                self.note(LogTag::Info, id, &format!("connected ({})", transport.kind()));
            }
            Err(e) => self.note(LogTag::Erro, id, &e.to_string()),
        }
        result
    }

    /// Disconnect `id`. Succeeds if it is not connected.
    pub async fn disconnect(&self, id: &str) -> Result<(), CommError> {
        let kind = self.kinds.write().remove(id);
        let Some(kind) = kind else {
            return Ok(());
        };

        let result = match kind {
            TransportKind::Serial => self.serial.disconnect(id).await,
            TransportKind::Tcp => self.tcp.disconnect(id).await,
            TransportKind::Telnet => self.telnet.disconnect(id).await,
        };

        match &result {
            Ok(()) => self.note(LogTag::Info, id, "disconnected"),
            Err(e) => self.note(LogTag::Erro, id, &e.to_string()),
        }
        result
    }

    /// Tear down every connection of every kind
    pub async fn disconnect_all(&self) -> Vec<CommError> {
        self.kinds.write().clear();

        let mut errors = self.serial.disconnect_all().await;
        errors.extend(self.tcp.disconnect_all().await);
        errors.extend(self.telnet.disconnect_all().await);

        for e in &errors {
            self.note(LogTag::Erro, e.id(), &e.to_string());
        }
        info!("All connections closed");
        errors
    }

    /// Send `text` to `id`. Telnet returns the correlated reply.
    pub async fn send(&self, id: &str, text: &str) -> Result<Option<String>, CommError> {
        let Some(kind) = self.kind_of(id) else {
            return Err(CommError::NotConnected(id.to_string()));
        };

        let result = match kind {
            TransportKind::Serial => self.serial.send(id, text).await.map(|()| None),
            TransportKind::Tcp => self.tcp.send(id, text).await.map(|()| None),
            TransportKind::Telnet => self.telnet.send(id, text).await.map(Some),
        };

        match &result {
            Ok(reply) => {
                self.note(LogTag::Sent, id, text);
                if let Some(reply) = reply {
                    self.note(LogTag::Recv, id, reply);
                }
            }
            Err(e) => {
                self.note(LogTag::Erro, id, &e.to_string());
                if !self.is_connected(id) {
                    self.kinds.write().remove(id);
                }
            }
        }
        result
    }

    /// Available serial ports; empty when enumeration fails
    pub fn list_ports(&self) -> Vec<String> {
        match transport::list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Failed to list serial ports: {}", e);
                Vec::new()
            }
        }
    }

    /// Open the journal on `path`, or today's file under the configured
    /// directory
    pub fn start_journal(&self, path: Option<PathBuf>) -> Result<PathBuf, LogError> {
        let logging = &self.config.logging;
        let path = path.unwrap_or_else(|| daily_log_path(&logging.log_dir(), &logging.channel));
        let path = self.journal.open(&logging.channel, path)?;
        info!("Journal: {}", path.display());
        Ok(path)
    }

    /// Close the journal, waiting for queued lines to reach the file
    pub fn stop_journal(&self) {
        blocking(|| self.journal.close(&self.config.logging.channel));
    }

    /// Whether the journal is open
    pub fn journaling(&self) -> bool {
        self.journal.is_open(&self.config.logging.channel)
    }

    /// Append a front-end message to the journal
    pub fn print(&self, tag: LogTag, text: &str) {
        blocking(|| self.journal.log(&self.config.logging.channel, tag, text));
    }

    fn note(&self, tag: LogTag, id: &str, text: &str) {
        self.print(tag, &format!("{id}: {text}"));
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        blocking(|| self.journal.close_all());
    }
}

/// Run a journal call that may block on a full queue or a writer join. On a
/// multi-threaded runtime the worker's other tasks move elsewhere meanwhile.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Journal every event, then hand it to the front end
async fn tap(
    mut raw: mpsc::Receiver<InboundEvent>,
    forward: EventSink,
    journal: Arc<LogBook>,
    channel: String,
) {
    while let Some(event) = raw.recv().await {
        let line = format!("{}: {}", event.source, event.payload);
        blocking(|| journal.log(&channel, event.kind.into(), &line));
        if forward.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping tap");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{TcpConfig, TelnetConfig};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unknown_id_is_not_connected() {
        let (hub, _events) = Hub::new(AppConfig::default());

        assert!(hub.disconnect("COM9").await.is_ok());
        assert!(matches!(
            hub.send("COM9", "x").await,
            Err(CommError::NotConnected(_))
        ));
        assert!(!hub.is_connected("COM9"));
    }

    #[tokio::test]
    async fn test_connect_journals_and_tracks_kind() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.logging.directory = Some(dir.path().to_path_buf());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await });

        let (hub, _events) = Hub::new(config);
        let path = hub.start_journal(None).unwrap();
        assert!(path.starts_with(dir.path().join("Commander")));

        hub.connect(&addr, &Transport::Tcp(TcpConfig::default()))
            .await
            .unwrap();
        let _peer = accept.await.unwrap().unwrap();
        assert_eq!(hub.kind_of(&addr), Some(TransportKind::Tcp));
        assert_eq!(hub.send(&addr, "PING").await.unwrap(), None);

        hub.disconnect(&addr).await.unwrap();
        assert_eq!(hub.kind_of(&addr), None);
        hub.stop_journal();

        let journal = std::fs::read_to_string(&path).unwrap();
        assert!(journal.contains("[INFO] "));
        assert!(journal.contains(&format!("{addr}: PING")));
        assert!(journal.contains(&format!("{addr}: disconnected")));
    }

    #[tokio::test]
    async fn test_connect_under_another_kind_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await });

        let (hub, _events) = Hub::new(AppConfig::default());
        hub.connect(&addr, &Transport::Tcp(TcpConfig::default()))
            .await
            .unwrap();
        let _peer = accept.await.unwrap().unwrap();

        let result = hub
            .connect(&addr, &Transport::Telnet(TelnetConfig::default()))
            .await;
        assert!(matches!(
            result,
            Err(CommError::Connect { ref source, .. }) if source.to_string().contains("TCP")
        ));
        assert_eq!(hub.kind_of(&addr), Some(TransportKind::Tcp));
        assert!(hub.tcp().is_connected(&addr));
        assert!(!hub.telnet().is_connected(&addr));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_full_journal_queue_does_not_stall_other_tasks() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.logging.queue_capacity = 1;
        let (hub, _events) = Hub::new(config);
        let path = hub.start_journal(Some(dir.path().join("busy.txt"))).unwrap();

        let ticks = tokio::spawn(async {
            let mut ticks = 0u32;
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                ticks += 1;
            }
            ticks
        });
        for i in 0..300 {
            hub.print(LogTag::Info, &format!("line {i}"));
        }
        assert_eq!(ticks.await.unwrap(), 5);

        hub.stop_journal();
        let journal = std::fs::read_to_string(&path).unwrap();
        assert!(journal.contains("line 0"));
        assert!(journal.contains("line 299"));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_tracked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (hub, _events) = Hub::new(AppConfig::default());
        let result = hub
            .connect(&addr, &Transport::Tcp(TcpConfig::default()))
            .await;
        assert!(matches!(result, Err(CommError::Connect { .. })));
        assert_eq!(hub.kind_of(&addr), None);
    }
}
