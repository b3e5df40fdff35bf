//! Session state machine and the shared session record.
//!
//! [`Session::apply`] is the only place state changes.  `remote_ready` is
//! recomputed on every transition so it is true exactly while the session is
//! [`SessionState::Active`]; capture reads it as its send gate.
//!
//! [`SharedSession`] is `Arc<Mutex<Session>>`.  The call controller is the
//! only writer; capture and playback only read it.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// States of a voice call.
///
/// ```text
/// Idle ──start call──▶ Connecting ──socket open──▶ AwaitingRemoteReady
///      ──remote ready──▶ Active ──end call / remote ended──▶ Ending
///      ──cleanup complete──▶ Idle
///
/// Connecting ──device or socket failure──▶ Failed
/// AwaitingRemoteReady ──timeout / remote error──▶ Failed
/// Connecting / AwaitingRemoteReady / Active ──socket lost──▶ Failed
/// Failed ──reconnected──▶ Connecting
/// Failed ──acknowledge──▶ Idle
/// Connecting / AwaitingRemoteReady / Failed ──end call──▶ Ending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No call.
    #[default]
    Idle,

    /// Microphone being acquired and socket opening.
    Connecting,

    /// Socket open; begin-session sent, waiting for the ready reply.
    AwaitingRemoteReady,

    /// Audio flows in both directions.
    Active,

    /// Tearing down.
    Ending,

    /// Something went wrong; either a reconnect or an acknowledgement follows.
    Failed,
}

impl SessionState {
    /// `true` for every state except `Idle`.
    ///
    /// ```
    /// use voice_call::session::SessionState;
    ///
    /// assert!(!SessionState::Idle.is_live());
    /// assert!(SessionState::Active.is_live());
    /// assert!(SessionState::Failed.is_live());
    /// ```
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }

    /// A short human-readable label for status output.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::AwaitingRemoteReady => "Waiting for agent",
            SessionState::Active => "In call",
            SessionState::Ending => "Ending",
            SessionState::Failed => "Failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartCall,
    TransportConnected,
    RemoteReady,
    HandshakeTimeout,
    RemoteError,
    DeviceFailed,
    TransportFailed,
    TransportLost,
    Reconnected,
    EndCall,
    RemoteEnded,
    CleanupComplete,
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{trigger:?} is not valid while the session is {state:?}")]
    InvalidTransition { state: SessionState, trigger: Trigger },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One call's bookkeeping.
#[derive(Debug, Default)]
pub struct Session {
    id: Option<String>,
    state: SessionState,
    remote_ready: bool,
    language: String,
    conversation_id: Option<String>,
    started_at: Option<Instant>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Outbound audio gate: true only while `Active`.
    pub fn remote_ready(&self) -> bool {
        self.remote_ready
    }

    /// Identifier of the current call, assigned on `StartCall`.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Id reported by the remote side in its ready reply, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub(crate) fn set_language(&mut self, language: &str) {
        self.language = language.to_string();
    }

    pub(crate) fn set_conversation_id(&mut self, id: Option<String>) {
        self.conversation_id = id;
    }

    /// Apply `trigger`, returning the new state.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidTransition`] when `trigger` is not accepted in
    /// the current state; the session is left unchanged.
    pub fn apply(&mut self, trigger: Trigger) -> Result<SessionState, SessionError> {
        use SessionState::*;
        use Trigger::*;

        let next = match (self.state, trigger) {
            (Idle, StartCall) => Connecting,
            (Connecting, TransportConnected) => AwaitingRemoteReady,
            (Connecting, DeviceFailed | TransportFailed) => Failed,
            (AwaitingRemoteReady, RemoteReady) => Active,
            (AwaitingRemoteReady, HandshakeTimeout | RemoteError) => Failed,
            (Connecting | AwaitingRemoteReady | Active, TransportLost) => Failed,
            (Active, EndCall | RemoteEnded) => Ending,
            (Connecting | AwaitingRemoteReady | Failed, EndCall) => Ending,
            (Failed, Reconnected) => Connecting,
            (Failed, Acknowledge) => Idle,
            (Ending, CleanupComplete) => Idle,
            (state, trigger) => return Err(SessionError::InvalidTransition { state, trigger }),
        };

        match (self.state, next) {
            (Idle, Connecting) => {
                self.id = Some(uuid::Uuid::new_v4().to_string());
                self.started_at = Some(Instant::now());
                self.conversation_id = None;
            }
            (_, Idle) => {
                self.id = None;
                self.started_at = None;
                self.conversation_id = None;
            }
            _ => {}
        }

        self.state = next;
        self.remote_ready = next == Active;
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// SharedSession
// ---------------------------------------------------------------------------

/// Thread-safe, cheaply-clonable handle to the session.
pub type SharedSession = Arc<Mutex<Session>>;

pub fn new_shared_session() -> SharedSession {
    Arc::new(Mutex::new(Session::new()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn session_in(path: &[Trigger]) -> Session {
        let mut session = Session::new();
        for &t in path {
            session.apply(t).expect("valid path");
        }
        session
    }

    #[test]
    fn happy_path_round_trip() {
        let mut s = Session::new();
        assert_eq!(s.apply(Trigger::StartCall), Ok(SessionState::Connecting));
        assert!(s.id().is_some());
        assert_eq!(
            s.apply(Trigger::TransportConnected),
            Ok(SessionState::AwaitingRemoteReady)
        );
        assert!(!s.remote_ready());
        assert_eq!(s.apply(Trigger::RemoteReady), Ok(SessionState::Active));
        assert!(s.remote_ready());
        assert_eq!(s.apply(Trigger::EndCall), Ok(SessionState::Ending));
        assert!(!s.remote_ready());
        assert_eq!(s.apply(Trigger::CleanupComplete), Ok(SessionState::Idle));
        assert!(s.id().is_none());
    }

    #[test]
    fn remote_ready_only_while_active() {
        let all = [
            Trigger::StartCall,
            Trigger::TransportConnected,
            Trigger::RemoteReady,
            Trigger::TransportLost,
            Trigger::Reconnected,
            Trigger::TransportConnected,
            Trigger::RemoteReady,
            Trigger::RemoteEnded,
            Trigger::CleanupComplete,
        ];
        let mut s = Session::new();
        for t in all {
            let next = s.apply(t).expect("valid path");
            assert_eq!(s.remote_ready(), next == SessionState::Active, "after {t:?}");
        }
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let mut s = Session::new();
        assert_eq!(
            s.apply(Trigger::RemoteReady),
            Err(SessionError::InvalidTransition {
                state: SessionState::Idle,
                trigger: Trigger::RemoteReady
            })
        );
        assert_eq!(s.state(), SessionState::Idle);

        let mut active = session_in(&[
            Trigger::StartCall,
            Trigger::TransportConnected,
            Trigger::RemoteReady,
        ]);
        assert!(active.apply(Trigger::StartCall).is_err());
        assert!(active.apply(Trigger::HandshakeTimeout).is_err());
        assert_eq!(active.state(), SessionState::Active);
    }

    #[test]
    fn handshake_failures_lead_to_failed() {
        for t in [Trigger::HandshakeTimeout, Trigger::RemoteError] {
            let mut s = session_in(&[Trigger::StartCall, Trigger::TransportConnected]);
            assert_eq!(s.apply(t), Ok(SessionState::Failed));
            assert_eq!(s.apply(Trigger::Acknowledge), Ok(SessionState::Idle));
        }
    }

    #[test]
    fn connect_failures_lead_to_failed() {
        for t in [Trigger::DeviceFailed, Trigger::TransportFailed] {
            let mut s = session_in(&[Trigger::StartCall]);
            assert_eq!(s.apply(t), Ok(SessionState::Failed));
        }
    }

    #[test]
    fn end_call_accepted_before_active() {
        for path in [
            &[Trigger::StartCall][..],
            &[Trigger::StartCall, Trigger::TransportConnected][..],
            &[Trigger::StartCall, Trigger::DeviceFailed][..],
        ] {
            let mut s = session_in(path);
            assert_eq!(s.apply(Trigger::EndCall), Ok(SessionState::Ending));
        }
    }

    #[test]
    fn ending_ignores_everything_but_cleanup() {
        let mut s = session_in(&[
            Trigger::StartCall,
            Trigger::TransportConnected,
            Trigger::RemoteReady,
            Trigger::EndCall,
        ]);
        for t in [Trigger::TransportLost, Trigger::EndCall, Trigger::RemoteReady] {
            assert!(s.apply(t).is_err());
        }
        assert_eq!(s.state(), SessionState::Ending);
    }

    #[test]
    fn new_call_gets_new_id() {
        let mut s = session_in(&[Trigger::StartCall]);
        let first = s.id().map(str::to_string);
        s.apply(Trigger::EndCall).unwrap();
        s.apply(Trigger::CleanupComplete).unwrap();
        s.apply(Trigger::StartCall).unwrap();
        assert_ne!(s.id().map(str::to_string), first);
    }

    #[test]
    fn labels_are_non_empty() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::AwaitingRemoteReady,
            SessionState::Active,
            SessionState::Ending,
            SessionState::Failed,
        ] {
            assert!(!state.label().is_empty());
        }
    }
}
