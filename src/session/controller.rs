//! Call orchestration.
//!
//! [`CallController`] owns the transport, capture pipeline and playback
//! queue for one voice call and is the only writer of the shared session.
//!
//! A call subscribes to every transport event kind when it starts and
//! forwards them into an mpsc channel drained by a single event task, so
//! inbound envelopes are handled in arrival order.  The subscriptions are
//! removed on every teardown path.
//!
//! The handshake is a race between three outcomes: the ready reply, a
//! remote error (or closure), and the timeout.  The event task resolves the
//! first two through a one-shot slot; whichever side empties the slot first
//! wins, and the loser finds it empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::audio::{AudioOutput, DeviceError, MicrophoneSource};
use crate::capture::{CapturePipeline, CaptureStats};
use crate::config::{AppConfig, SessionConfig};
use crate::playback::{InboundChunk, PlaybackQueue, PlaybackStats};
use crate::transport::{
    Envelope, EnvelopeSink, SubscriptionId, TransportChannel, TransportError, TransportEvent,
    TransportEventKind,
};

use super::state::{new_shared_session, SessionError, SessionState, SharedSession, Trigger};

/// Shown when the transport gives up reconnecting.
pub const CONNECTION_LOST_MESSAGE: &str = "The connection to the voice service was lost.";

// ---------------------------------------------------------------------------
// CallEvent
// ---------------------------------------------------------------------------

/// Notifications for whatever presents the call to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(SessionState),
    ConversationStart {
        conversation_id: Option<String>,
    },
    ConversationEnd,
    /// A transcript line; `is_user` is false for the agent's replies.
    Message {
        text: String,
        is_user: bool,
        timestamp: DateTime<Local>,
    },
    Error {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// CallError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("voice service did not confirm the session within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("voice service rejected the session: {0}")]
    Remote(String),

    #[error("connection closed before the session could continue")]
    ConnectionClosed,

    #[error("connection lost and reconnection failed")]
    ConnectionLost,

    #[error("call was ended while starting")]
    Cancelled,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl CallError {
    /// Text suitable for showing to the person making the call.
    pub fn user_message(&self) -> String {
        match self {
            CallError::Device(e) => e.user_message(),
            CallError::Transport(_) => {
                "Could not reach the voice service. Check your network connection and try again."
                    .into()
            }
            CallError::HandshakeTimeout(_) => {
                "The voice service did not respond in time. Please try again.".into()
            }
            CallError::Remote(message) => format!("The voice service reported an error: {message}"),
            CallError::ConnectionClosed => "The voice service closed the connection.".into(),
            CallError::ConnectionLost => CONNECTION_LOST_MESSAGE.into(),
            CallError::Cancelled => "The call was cancelled.".into(),
            CallError::Session(e) => e.to_string(),
        }
    }

    fn failure_trigger(&self, state: SessionState) -> Trigger {
        match (self, state) {
            (CallError::Device(_), _) => Trigger::DeviceFailed,
            (CallError::HandshakeTimeout(_), _) => Trigger::HandshakeTimeout,
            (CallError::Remote(_) | CallError::ConnectionClosed, SessionState::AwaitingRemoteReady) => {
                Trigger::RemoteError
            }
            (CallError::Transport(_), SessionState::Connecting) => Trigger::TransportFailed,
            _ => Trigger::TransportLost,
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum HandshakeOutcome {
    Ready(Option<String>),
    Rejected(String),
    Closed,
}

/// Transport subscriptions belonging to one call.
struct CallScope {
    subscriptions: Vec<SubscriptionId>,
    closed: AtomicBool,
}

struct ControllerInner {
    config: SessionConfig,
    transport: TransportChannel,
    capture: CapturePipeline,
    playback: PlaybackQueue,
    session: SharedSession,
    events: mpsc::UnboundedSender<CallEvent>,
    scope: Mutex<Option<Arc<CallScope>>>,
    handshake: Mutex<Option<oneshot::Sender<HandshakeOutcome>>>,
    /// Set while a mid-call drop is being recovered; state changes are not
    /// reported until the call is active again or given up.
    resuming: AtomicBool,
}

// ---------------------------------------------------------------------------
// CallController
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        config: &SessionConfig,
        transport: TransportChannel,
        capture: CapturePipeline,
        playback: PlaybackQueue,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            inner: Arc::new(ControllerInner {
                config: config.clone(),
                transport,
                capture,
                playback,
                session: new_shared_session(),
                events,
                scope: Mutex::new(None),
                handshake: Mutex::new(None),
                resuming: AtomicBool::new(false),
            }),
        };
        (controller, rx)
    }

    /// Wire up transport, capture and playback from `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(
        config: &AppConfig,
        microphone: Arc<dyn MicrophoneSource>,
        output: Arc<dyn AudioOutput>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let transport = TransportChannel::new(&config.transport);
        let sink: Arc<dyn EnvelopeSink> = Arc::new(transport.clone());
        let capture = CapturePipeline::new(microphone, sink, &config.capture);
        let playback = PlaybackQueue::new(output, &config.playback);
        Self::new(&config.session, transport, capture, playback)
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.inner.session)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn transport(&self) -> &TransportChannel {
        &self.inner.transport
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.inner.capture.stats()
    }

    pub fn playback_stats(&self) -> PlaybackStats {
        self.inner.playback.stats()
    }

    /// Acquire the microphone, open the socket and perform the handshake.
    ///
    /// On any failure everything acquired so far is released, a
    /// [`CallEvent::Error`] is emitted, and the session returns to `Idle`.
    ///
    /// # Errors
    ///
    /// [`CallError::Session`] if a call is already in progress; otherwise the
    /// cause of the failed start.
    pub async fn start_call(&self, language: Option<&str>) -> Result<(), CallError> {
        let inner = &self.inner;
        let language = language.unwrap_or(inner.config.language.as_str()).to_string();

        inner.transition(Trigger::StartCall)?;
        inner.resuming.store(false, Ordering::SeqCst);
        let call_id = {
            let mut session = inner.session.lock();
            session.set_language(&language);
            session.id().map(str::to_string)
        };
        log::info!("session: starting call in {language:?}");
        inner.open_scope();

        if let Err(e) = inner.capture.start(&inner.session) {
            return Err(inner.abort_start(call_id.as_deref(), e.into()));
        }
        if let Err(e) = inner.transport.connect().await {
            return Err(inner.abort_start(call_id.as_deref(), e.into()));
        }
        match inner.handshake().await {
            Ok(conversation_id) => {
                log::info!("session: active (conversation {conversation_id:?})");
                inner.emit(CallEvent::ConversationStart { conversation_id });
                Ok(())
            }
            Err(e) => Err(inner.abort_start(call_id.as_deref(), e)),
        }
    }

    /// End the call.  The send gate closes before this returns.
    pub fn end_call(&self) {
        let inner = &self.inner;
        if matches!(inner.state(), SessionState::Idle | SessionState::Ending) {
            log::debug!("session: end requested with no call in progress");
            return;
        }
        inner.resuming.store(false, Ordering::SeqCst);
        if let Err(e) = inner.transition(Trigger::EndCall) {
            log::warn!("session: {e}");
            return;
        }
        log::info!("session: ending call");
        inner.finish_ending(true);
    }
}

impl ControllerInner {
    fn state(&self) -> SessionState {
        self.session.lock().state()
    }

    fn emit(&self, event: CallEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, trigger: Trigger) -> Result<SessionState, SessionError> {
        let next = self.session.lock().apply(trigger)?;
        log::debug!("session: {trigger:?} -> {}", next.label());
        let quiet = if next == SessionState::Active {
            self.resuming.swap(false, Ordering::SeqCst)
        } else {
            self.resuming.load(Ordering::SeqCst)
        };
        if !quiet {
            self.emit(CallEvent::StateChanged(next));
        }
        Ok(next)
    }

    // ----- Subscriptions -----

    fn open_scope(self: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel::<TransportEvent>();
        let subscriptions = [
            TransportEventKind::Message,
            TransportEventKind::Connected,
            TransportEventKind::Disconnected,
            TransportEventKind::Error,
        ]
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            self.transport.on(kind, move |event| {
                let _ = tx.send(event.clone());
            })
        })
        .collect();

        let scope = Arc::new(CallScope {
            subscriptions,
            closed: AtomicBool::new(false),
        });
        if let Some(stale) = self.scope.lock().replace(Arc::clone(&scope)) {
            self.release(&stale);
        }
        tokio::spawn(Arc::clone(self).run_events(scope, rx));
    }

    fn close_scope(&self) {
        if let Some(scope) = self.scope.lock().take() {
            self.release(&scope);
        }
    }

    fn release(&self, scope: &CallScope) {
        scope.closed.store(true, Ordering::SeqCst);
        for id in &scope.subscriptions {
            self.transport.off(*id);
        }
    }

    async fn run_events(
        self: Arc<Self>,
        scope: Arc<CallScope>,
        mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if scope.closed.load(Ordering::SeqCst) {
                break;
            }
            self.handle_event(event);
        }
        log::debug!("session: event task finished");
    }

    // ----- Handshake -----

    async fn handshake(&self) -> Result<Option<String>, CallError> {
        let (tx, rx) = oneshot::channel();
        *self.handshake.lock() = Some(tx);

        if let Err(e) = self.transition(Trigger::TransportConnected) {
            self.handshake.lock().take();
            return Err(e.into());
        }

        let language = self.session.lock().language().to_string();
        let begin = Envelope::begin(self.config.begin_message, &self.config.context, &language);
        if let Err(e) = self.transport.send(&begin) {
            self.handshake.lock().take();
            return Err(e.into());
        }

        let limit = Duration::from_millis(self.config.handshake_timeout_ms);
        log::info!("session: sent {}, waiting up to {limit:?}", begin.kind());

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(HandshakeOutcome::Ready(conversation_id))) => Ok(conversation_id),
            Ok(Ok(HandshakeOutcome::Rejected(message))) => Err(CallError::Remote(message)),
            Ok(Ok(HandshakeOutcome::Closed)) | Ok(Err(_)) => Err(CallError::ConnectionClosed),
            Err(_) => {
                let still_pending = self.handshake.lock().take().is_some();
                if !still_pending && self.state() == SessionState::Active {
                    // The ready reply won the race with the timer.
                    Ok(self.session.lock().conversation_id().map(str::to_string))
                } else {
                    Err(CallError::HandshakeTimeout(limit))
                }
            }
        }
    }

    /// Resume a call whose socket was restored by the transport.
    async fn resume(self: Arc<Self>) {
        if self.transition(Trigger::Reconnected).is_err() {
            return;
        }
        match self.handshake().await {
            Ok(_) => log::info!("session: resumed after reconnect"),
            Err(e) => self.fail_call(e),
        }
    }

    // ----- Teardown -----

    /// Undo a failed start.  Returns the error to hand back to the caller,
    /// or [`CallError::Cancelled`] if `end_call` got there first.
    fn abort_start(&self, call_id: Option<&str>, error: CallError) -> CallError {
        let (state, current_id) = {
            let session = self.session.lock();
            (session.state(), session.id().map(str::to_string))
        };
        if current_id.as_deref() != call_id
            || matches!(state, SessionState::Idle | SessionState::Ending)
        {
            log::info!("session: start abandoned: {error}");
            return CallError::Cancelled;
        }

        log::error!("session: call start failed: {error}");
        self.close_scope();
        self.capture.stop();
        self.handshake.lock().take();
        self.transport.disconnect();
        self.playback.clear();

        if state != SessionState::Failed {
            if let Err(e) = self.transition(error.failure_trigger(state)) {
                log::warn!("session: {e}");
            }
        }
        self.emit(CallEvent::Error {
            message: error.user_message(),
        });
        if let Err(e) = self.transition(Trigger::Acknowledge) {
            log::warn!("session: {e}");
        }
        error
    }

    /// Tear down a live call after an unrecoverable error.
    fn fail_call(&self, error: CallError) {
        let state = self.state();
        if matches!(state, SessionState::Idle | SessionState::Ending) {
            return;
        }

        log::error!("session: call failed: {error}");
        let was_resuming = self.resuming.swap(false, Ordering::SeqCst);
        if was_resuming && state == SessionState::Failed {
            self.emit(CallEvent::StateChanged(state));
        }
        self.close_scope();
        self.capture.stop();
        self.handshake.lock().take();
        self.transport.disconnect();
        self.playback.clear();

        if state != SessionState::Failed {
            if let Err(e) = self.transition(error.failure_trigger(state)) {
                log::warn!("session: {e}");
            }
        }
        self.emit(CallEvent::Error {
            message: error.user_message(),
        });
        if let Err(e) = self.transition(Trigger::Acknowledge) {
            log::warn!("session: {e}");
        }
        self.emit(CallEvent::ConversationEnd);
    }

    /// Cleanup once the session is `Ending`.
    fn finish_ending(&self, notify_remote: bool) {
        self.capture.stop();
        self.close_scope();
        self.handshake.lock().take();
        if notify_remote && self.transport.is_connected() {
            let _ = self.transport.send(&Envelope::EndConversation);
        }
        self.transport.disconnect();
        self.playback.clear();
        if let Err(e) = self.transition(Trigger::CleanupComplete) {
            log::warn!("session: {e}");
        }
        self.emit(CallEvent::ConversationEnd);
    }

    // ----- Event handling -----

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(envelope) => self.handle_envelope(envelope),

            TransportEvent::Connected => {
                if self.state() == SessionState::Failed {
                    log::info!("session: socket restored, resuming");
                    tokio::spawn(Arc::clone(self).resume());
                }
            }

            TransportEvent::Disconnected { unexpected } => {
                let pending = self.handshake.lock().take();
                if let Some(tx) = pending {
                    let _ = tx.send(HandshakeOutcome::Closed);
                    return;
                }
                match (self.state(), unexpected) {
                    (SessionState::Active, true) => {
                        log::warn!("session: connection lost mid-call, waiting for reconnect");
                        self.resuming.store(true, Ordering::SeqCst);
                        if let Err(e) = self.transition(Trigger::TransportLost) {
                            self.resuming.store(false, Ordering::SeqCst);
                            log::warn!("session: {e}");
                        }
                    }
                    (SessionState::Active | SessionState::Failed, false) => {
                        self.fail_call(CallError::ConnectionClosed)
                    }
                    _ => {}
                }
            }

            TransportEvent::Error {
                message,
                retries_exhausted,
            } => {
                if retries_exhausted {
                    self.fail_call(CallError::ConnectionLost);
                } else {
                    log::debug!("session: transport error: {message}");
                }
            }
        }
    }

    fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::ElevenlabsConnected { conversation_id } => {
                let mut slot = self.handshake.lock();
                let Some(tx) = slot.take() else {
                    log::debug!("session: ready reply outside a handshake ignored");
                    return;
                };
                self.session
                    .lock()
                    .set_conversation_id(conversation_id.clone());
                match self.transition(Trigger::RemoteReady) {
                    Ok(_) => {
                        let _ = tx.send(HandshakeOutcome::Ready(conversation_id));
                    }
                    Err(e) => {
                        log::warn!("session: {e}");
                        let _ = tx.send(HandshakeOutcome::Closed);
                    }
                }
            }

            Envelope::ElevenlabsConnecting => {
                log::info!("session: voice service is opening the conversation");
            }

            Envelope::Error { message } => {
                let pending = self.handshake.lock().take();
                if let Some(tx) = pending {
                    let _ = tx.send(HandshakeOutcome::Rejected(message));
                } else {
                    log::warn!("session: voice service error: {message}");
                    self.emit(CallEvent::Error { message });
                }
            }

            Envelope::ElevenlabsDisconnected => {
                let pending = self.handshake.lock().take();
                if let Some(tx) = pending {
                    let _ = tx.send(HandshakeOutcome::Closed);
                } else if self.state() == SessionState::Active
                    && self.transition(Trigger::RemoteEnded).is_ok()
                {
                    log::info!("session: voice service ended the conversation");
                    self.finish_ending(false);
                }
            }

            Envelope::AudioChunk { audio, format } => {
                if matches!(self.state(), SessionState::Idle | SessionState::Ending) {
                    return;
                }
                match InboundChunk::from_base64(&audio, format) {
                    Ok(chunk) => {
                        self.playback.enqueue(chunk);
                    }
                    Err(e) => log::warn!("session: undecodable audio payload: {e}"),
                }
            }

            Envelope::UserTranscript { text } => self.emit(CallEvent::Message {
                text,
                is_user: true,
                timestamp: Local::now(),
            }),

            Envelope::AiResponse { text } => self.emit(CallEvent::Message {
                text,
                is_user: false,
                timestamp: Local::now(),
            }),

            Envelope::AudioQueued => log::trace!("session: audio queued"),

            other => log::debug!("session: ignoring inbound {}", other.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
