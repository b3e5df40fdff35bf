//! Socket lifecycle, subscriptions and reconnection.
//!
//! One reader task and one writer task run per open socket.  Every socket
//! gets a generation number so a reader that outlives its socket (after a
//! manual close followed by a fresh connect) cannot clobber the newer state.
//!
//! Reconnect policy: on an unexpected close (not requested locally and not a
//! server close with code 1000) the channel waits `attempt * base_delay` and
//! reconnects, up to `max_reconnect_attempts` consecutive attempts.  A
//! successful open resets the counter; exhausting it emits an
//! [`TransportEvent::Error`] with `retries_exhausted` set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::TransportConfig;

use super::endpoint::Endpoint;
use super::message::Envelope;
use super::{EnvelopeSink, TransportError};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Message,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A parsed inbound envelope of a known kind.
    Message(Envelope),
    Connected,
    /// `unexpected` is false for local closes and server closes with 1000.
    Disconnected { unexpected: bool },
    Error {
        message: String,
        retries_exhausted: bool,
    },
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Message(_) => TransportEventKind::Message,
            TransportEvent::Connected => TransportEventKind::Connected,
            TransportEvent::Disconnected { .. } => TransportEventKind::Disconnected,
            TransportEvent::Error { .. } => TransportEventKind::Error,
        }
    }
}

/// Handle returned by [`TransportChannel::on`]; pass it to `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct ConnectionRecord {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    generation: u64,
    manual_close: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: TransportConfig,
    endpoint: Endpoint,
    record: Mutex<ConnectionRecord>,
    status_tx: watch::Sender<ConnectionStatus>,
    handlers: Mutex<Vec<(SubscriptionId, TransportEventKind, Handler)>>,
    next_id: AtomicU64,
}

enum ConnectPlan {
    AlreadyOpen,
    Wait(watch::Receiver<ConnectionStatus>),
    Open(u64),
}

// ---------------------------------------------------------------------------
// TransportChannel
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle to the shared socket.
#[derive(Clone)]
pub struct TransportChannel {
    inner: Arc<Inner>,
}

impl TransportChannel {
    pub fn new(config: &TransportConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                endpoint: Endpoint::from_config(config),
                record: Mutex::new(ConnectionRecord {
                    status: ConnectionStatus::Disconnected,
                    reconnect_attempts: 0,
                    outbound: None,
                    generation: 0,
                    manual_close: false,
                    reconnect_task: None,
                }),
                status_tx,
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.record.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.record.lock().reconnect_attempts
    }

    /// Open the socket if it is not already open.
    ///
    /// Concurrent callers while an open is in flight share its outcome; a
    /// second socket is never created.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let plan = {
            let mut rec = self.inner.record.lock();
            match rec.status {
                ConnectionStatus::Connected => ConnectPlan::AlreadyOpen,
                ConnectionStatus::Connecting => ConnectPlan::Wait(self.inner.status_tx.subscribe()),
                ConnectionStatus::Disconnected | ConnectionStatus::Errored => {
                    if let Some(stale) = rec.outbound.take() {
                        let _ = stale.send(WsMessage::Close(None));
                    }
                    rec.generation += 1;
                    rec.manual_close = false;
                    self.set_status(&mut rec, ConnectionStatus::Connecting);
                    ConnectPlan::Open(rec.generation)
                }
            }
        };

        match plan {
            ConnectPlan::AlreadyOpen => Ok(()),
            ConnectPlan::Wait(rx) => Self::wait_for_open(rx).await,
            ConnectPlan::Open(generation) => self.open(generation).await,
        }
    }

    /// Serialize and send `envelope`.
    ///
    /// Fails with [`TransportError::NotConnected`] when no socket is open;
    /// the failure is also logged at error level.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let result = self.try_send(envelope);
        if let Err(e) = &result {
            log::error!("transport: cannot send {}: {e}", envelope.kind());
        }
        result
    }

    fn try_send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Serialize(e.to_string()))?;
        let rec = self.inner.record.lock();
        match (&rec.outbound, rec.status) {
            (Some(tx), ConnectionStatus::Connected) => tx
                .send(WsMessage::Text(json))
                .map_err(|_| TransportError::NotConnected),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: TransportEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .push((id, kind, Arc::new(handler)));
        id
    }

    /// Remove a handler.  Returns `false` if `id` was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sid, _, _)| *sid != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Close the socket with code 1000 and suppress any reconnection.
    pub fn disconnect(&self) {
        let (outbound, task) = {
            let mut rec = self.inner.record.lock();
            rec.manual_close = true;
            rec.reconnect_attempts = self.inner.config.max_reconnect_attempts;
            let outbound = rec.outbound.take();
            let task = rec.reconnect_task.take();
            self.set_status(&mut rec, ConnectionStatus::Disconnected);
            (outbound, task)
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(tx) = outbound {
            log::info!("transport: closing socket");
            let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "call ended".into(),
            })));
        }
    }

    // ----- Connection internals -----

    fn set_status(&self, rec: &mut ConnectionRecord, status: ConnectionStatus) {
        rec.status = status;
        self.inner.status_tx.send_replace(status);
    }

    async fn wait_for_open(
        mut rx: watch::Receiver<ConnectionStatus>,
    ) -> Result<(), TransportError> {
        let settled = rx
            .wait_for(|s| *s != ConnectionStatus::Connecting)
            .await
            .map(|s| *s);
        match settled {
            Ok(ConnectionStatus::Connected) => Ok(()),
            Ok(status) => Err(TransportError::Connect(format!(
                "in-flight connection attempt ended {status:?}"
            ))),
            Err(_) => Err(TransportError::NotConnected),
        }
    }

    async fn open(&self, generation: u64) -> Result<(), TransportError> {
        let result = self.establish(generation).await;
        if let Err(e) = &result {
            {
                let mut rec = self.inner.record.lock();
                if rec.generation == generation && rec.status == ConnectionStatus::Connecting {
                    self.set_status(&mut rec, ConnectionStatus::Errored);
                }
            }
            log::warn!("transport: connect failed: {e}");
            self.emit(&TransportEvent::Error {
                message: e.to_string(),
                retries_exhausted: false,
            });
        }
        result
    }

    async fn establish(&self, generation: u64) -> Result<(), TransportError> {
        let url = self.inner.endpoint.resolve()?;
        let limit = Duration::from_secs(self.inner.config.connect_timeout_secs);
        log::info!("transport: connecting to {url}");

        let (socket, _response) =
            tokio::time::timeout(limit, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(limit))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

        let superseded = {
            let mut rec = self.inner.record.lock();
            let superseded = rec.generation != generation || rec.manual_close;
            if !superseded {
                rec.outbound = Some(out_tx);
                rec.reconnect_attempts = 0;
                self.set_status(&mut rec, ConnectionStatus::Connected);
            }
            superseded
        };
        if superseded {
            let _ = sink.send(WsMessage::Close(None)).await;
            return Err(TransportError::Connect("connect cancelled by disconnect".into()));
        }

        // ----- Writer -----
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::warn!("transport: write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // ----- Reader -----
        let channel = self.clone();
        tokio::spawn(async move {
            let mut normal_close = false;
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match Envelope::from_json(&text) {
                        Ok(Envelope::Unknown) => {
                            log::debug!("transport: ignoring envelope of unknown kind");
                        }
                        Ok(envelope) => channel.emit(&TransportEvent::Message(envelope)),
                        Err(e) => log::warn!("transport: malformed frame ignored: {e}"),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        normal_close = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        log::info!("transport: server closed socket: {frame:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("transport: socket error: {e}");
                        break;
                    }
                }
            }
            channel.handle_close(generation, normal_close);
        });

        log::info!("transport: connected");
        self.emit(&TransportEvent::Connected);
        Ok(())
    }

    fn handle_close(&self, generation: u64, normal_close: bool) {
        let unexpected = {
            let mut rec = self.inner.record.lock();
            if rec.generation != generation {
                return;
            }
            rec.outbound = None;
            self.set_status(&mut rec, ConnectionStatus::Disconnected);
            !rec.manual_close && !normal_close
        };

        if unexpected {
            log::warn!("transport: socket closed unexpectedly");
        }
        self.emit(&TransportEvent::Disconnected { unexpected });
        if unexpected {
            self.schedule_reconnect();
        }
    }

    // ----- Reconnect -----

    fn schedule_reconnect(&self) {
        let channel = self.clone();
        let task = tokio::spawn(async move { channel.reconnect_loop().await });
        if let Some(previous) = self.inner.record.lock().reconnect_task.replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let max = self.inner.config.max_reconnect_attempts;
        let base = self.inner.config.reconnect_base_delay_ms;

        loop {
            let attempt = {
                let mut rec = self.inner.record.lock();
                if rec.manual_close {
                    return;
                }
                if rec.reconnect_attempts >= max {
                    None
                } else {
                    rec.reconnect_attempts += 1;
                    Some(rec.reconnect_attempts)
                }
            };

            let Some(attempt) = attempt else {
                log::error!("transport: giving up after {max} reconnect attempts");
                self.emit(&TransportEvent::Error {
                    message: format!("connection lost after {max} reconnect attempts"),
                    retries_exhausted: true,
                });
                return;
            };

            let delay = Duration::from_millis(base.saturating_mul(attempt as u64));
            log::info!("transport: reconnect attempt {attempt}/{max} in {delay:?}");
            tokio::time::sleep(delay).await;

            if self.inner.record.lock().manual_close {
                return;
            }
            if self.connect().await.is_ok() {
                return;
            }
        }
    }

    fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

impl EnvelopeSink for TransportChannel {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        TransportChannel::send(self, envelope)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
