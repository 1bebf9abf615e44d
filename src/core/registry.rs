//! Connection registries
//!
//! A [`Registry`] owns every live connection of one transport kind. It holds at
//! most one record per connection id, runs exactly one read task per record and
//! routes `connect`/`disconnect`/`send` calls. Serial and TCP use the same
//! registry with different openers; Telnet has its own in
//! [`session`](super::session).

use super::error::CommError;
use super::event::{EventSink, InboundEvent};
use super::framing::{encode_line, LineFramer, DEFAULT_MAX_FRAME_LEN};
use super::transport::{
    is_already_closed, is_closed_handle, is_dead_peer, BoxedReader, BoxedWriter, Framing, Opener,
    SerialOpener, TcpOpener, TransportKind,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry of serial port connections, keyed by port name
pub type SerialRegistry = Registry<SerialOpener>;

/// Registry of raw TCP connections, keyed by `host:port`
pub type TcpRegistry = Registry<TcpOpener>;

/// Read task tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Read deadline per poll in milliseconds; bounds how long a read task
    /// takes to notice a disconnect
    pub read_timeout_ms: u64,
    /// Size of the read buffer
    pub read_buffer_size: usize,
    /// Frame cap for line framing
    pub max_frame_len: usize,
}

impl RegistryConfig {
    /// Read deadline per poll
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Set the read deadline
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1_000,
            read_buffer_size: 4096,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// One live connection. The read half and the framer accumulator belong to
/// the read task; everything here is shared with senders and disconnect.
struct ConnectionRecord {
    generation: u64,
    writer: AsyncMutex<Option<BoxedWriter>>,
    disconnecting: AtomicBool,
    cancel: CancellationToken,
    /// Cancelled once the read task has dropped the read half
    finished: CancellationToken,
}

impl ConnectionRecord {
    fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Write one frame, giving up as soon as the record is cancelled
    async fn write(&self, frame: &[u8]) -> io::Result<()> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return Err(closed());
            };
            writer.write_all(frame).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(closed()),
            result = write => result,
        }
    }

    /// Mark, stop the read task and close the write side
    async fn close(&self) -> io::Result<()> {
        self.disconnecting.store(true, Ordering::Release);
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return Ok(());
        };
        match writer.shutdown().await {
            Err(e) if !is_already_closed(&e) => Err(e),
            _ => Ok(()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

struct Inner<O: Opener> {
    opener: O,
    config: RegistryConfig,
    records: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    connect_gate: AsyncMutex<()>,
    next_generation: AtomicU64,
}

/// Connection registry for one transport kind
pub struct Registry<O: Opener> {
    inner: Arc<Inner<O>>,
}

impl<O: Opener> Clone for Registry<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum ReadOutcome {
    Continue,
    Stop,
}

impl<O: Opener> Registry<O> {
    /// Create a registry with default read settings
    pub fn new(opener: O) -> Self {
        Self::with_config(opener, RegistryConfig::default())
    }

    /// Create a registry with custom read settings
    pub fn with_config(opener: O, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                opener,
                config,
                records: RwLock::new(HashMap::new()),
                connect_gate: AsyncMutex::new(()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Transport kind served by this registry
    pub fn kind(&self) -> TransportKind {
        self.inner.opener.kind()
    }

    /// The opener used for new connections
    pub fn opener(&self) -> &O {
        &self.inner.opener
    }

    /// Whether `id` has a live record
    pub fn is_connected(&self, id: &str) -> bool {
        self.inner.records.read().contains_key(id)
    }

    /// Ids of all live records
    pub fn ids(&self) -> Vec<String> {
        self.inner.records.read().keys().cloned().collect()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// No live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open `id` and start its read task.
    ///
    /// Returns `Ok` without opening anything if `id` is already connected.
    /// Every decoded message and fatal read error is sent to `events`.
    pub async fn connect(
        &self,
        id: &str,
        params: &O::Params,
        events: EventSink,
    ) -> Result<(), CommError> {
        let _gate = self.inner.connect_gate.lock().await;

        if self.is_connected(id) {
            debug!("{} {} already connected", self.kind(), id);
            return Ok(());
        }

        let link = self
            .inner
            .opener
            .open(id, params)
            .await
            .map_err(|e| CommError::connect(id, e))?;

        let record = Arc::new(ConnectionRecord {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            writer: AsyncMutex::new(Some(link.writer)),
            disconnecting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        });
        self.inner
            .records
            .write()
            .insert(id.to_string(), Arc::clone(&record));

        let registry = self.clone();
        let task_id = id.to_string();
        let finished = record.finished.clone().drop_guard();
        tokio::spawn(async move {
            let _finished = finished;
            registry.read_loop(task_id, record, link.reader, events).await;
        });

        info!("{} {} connected", self.kind(), id);
        Ok(())
    }

    /// Close `id` and remove its record. Succeeds if `id` is not connected.
    ///
    /// Interrupts a pending `send` and returns only after the read task has
    /// let go of the transport.
    pub async fn disconnect(&self, id: &str) -> Result<(), CommError> {
        let record = self.inner.records.write().remove(id);
        let Some(record) = record else {
            return Ok(());
        };

        let result = record.close().await;
        record.finished.cancelled().await;
        result.map_err(|source| CommError::Close {
            id: id.to_string(),
            source,
        })?;

        info!("{} {} disconnected", self.kind(), id);
        Ok(())
    }

    /// Disconnect every live record, collecting failures
    pub async fn disconnect_all(&self) -> Vec<CommError> {
        let mut errors = Vec::new();
        for id in self.ids() {
            if let Err(e) = self.disconnect(&id).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Write `payload` followed by CR LF.
    ///
    /// A write failure caused by a dead peer also releases the connection in
    /// the background.
    pub async fn send(&self, id: &str, payload: &str) -> Result<(), CommError> {
        let record = self.inner.records.read().get(id).cloned();
        let Some(record) = record else {
            return Err(CommError::NotConnected(id.to_string()));
        };

        let frame = encode_line(payload);
        if let Err(e) = record.write(&frame).await {
            if is_dead_peer(&e) && !record.is_disconnecting() {
                let registry = self.clone();
                let id = id.to_string();
                let generation = record.generation;
                tokio::spawn(async move { registry.release(&id, generation).await });
            }
            return Err(CommError::send(id, e));
        }

        debug!("[{}] sent '{}'", id, payload);
        Ok(())
    }

    /// Remove and close `id` only if it is still the record of `generation`
    async fn release(&self, id: &str, generation: u64) {
        let record = {
            let mut records = self.inner.records.write();
            match records.get(id) {
                Some(record) if record.generation == generation => records.remove(id),
                _ => None,
            }
        };

        if let Some(record) = record {
            if let Err(e) = record.close().await {
                debug!("{} {} close after read task exit: {}", self.kind(), id, e);
            }
            info!("{} {} released", self.kind(), id);
        }
    }

    async fn read_loop(
        self,
        id: String,
        record: Arc<ConnectionRecord>,
        mut reader: BoxedReader,
        events: EventSink,
    ) {
        let read_timeout = self.inner.config.read_timeout();
        let framing = self.inner.opener.framing();
        let mut framer = LineFramer::with_max_frame_len(self.inner.config.max_frame_len);
        let mut buf = vec![0u8; self.inner.config.read_buffer_size.max(1)];

        loop {
            let read = tokio::select! {
                _ = record.cancel.cancelled() => break,
                read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => read,
            };

            let outcome = match read {
                // Idle: no data within the deadline
                Err(_elapsed) => ReadOutcome::Continue,
                Ok(Ok(0)) => {
                    if !record.is_disconnecting() {
                        emit(
                            &record,
                            &events,
                            InboundEvent::info(&id, "connection closed by peer"),
                        )
                        .await;
                    }
                    ReadOutcome::Stop
                }
                Ok(Ok(n)) => {
                    let batch = match framing {
                        Framing::Raw => {
                            vec![InboundEvent::data(&id, String::from_utf8_lossy(&buf[..n]))]
                        }
                        Framing::Lines => {
                            framer.feed(&buf[..n]);
                            framer
                                .drain()
                                .map(|message| match message {
                                    Ok(line) => InboundEvent::data(&id, line),
                                    Err(e) => InboundEvent::error(&id, e.to_string()),
                                })
                                .collect()
                        }
                    };
                    deliver(&record, &events, batch).await
                }
                Ok(Err(e))
                    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
                {
                    ReadOutcome::Continue
                }
                Ok(Err(e)) => {
                    if !record.is_disconnecting()
                        && !is_closed_handle(&e)
                        && e.kind() != io::ErrorKind::UnexpectedEof
                    {
                        warn!("[{}] read error: {}", id, e);
                        emit(&record, &events, InboundEvent::error(&id, e.to_string())).await;
                    }
                    ReadOutcome::Stop
                }
            };

            if let ReadOutcome::Stop = outcome {
                break;
            }
        }

        drop(reader);
        self.release(&id, record.generation).await;
    }
}

/// Forward one event unless the record is cancelled first. `false` once the
/// event cannot be delivered.
async fn emit(record: &ConnectionRecord, events: &EventSink, event: InboundEvent) -> bool {
    tokio::select! {
        _ = record.cancel.cancelled() => false,
        sent = events.send(event) => match sent {
            Ok(()) => true,
            Err(_) => {
                debug!("event consumer dropped, ending read task");
                false
            }
        },
    }
}

/// Forward a batch in order; `Stop` once the consumer is gone or the record
/// is cancelled
async fn deliver(
    record: &ConnectionRecord,
    events: &EventSink,
    batch: Vec<InboundEvent>,
) -> ReadOutcome {
    for event in batch {
        if !emit(record, events, event).await {
            return ReadOutcome::Stop;
        }
    }
    ReadOutcome::Continue
}
