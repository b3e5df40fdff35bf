//! Voice-call session: the state machine and the controller that drives it.

pub mod controller;
pub mod state;

pub use controller::{CallController, CallError, CallEvent, CONNECTION_LOST_MESSAGE};
pub use state::{new_shared_session, Session, SessionError, SessionState, SharedSession, Trigger};
