//! Shared data model for the Overture orchestration core.
//!
//! Everything that crosses a process or task boundary lives here: the
//! canonical event schema adapters emit, the WebSocket wire envelope, the
//! append-only transcript rows, and the pure projection that rebuilds
//! per-agent session state from a persisted transcript.

pub mod envelope;
pub mod event;
pub mod message;
pub mod session;

pub use envelope::{
    ClientCommand, ImageAttachment, OutboundFrame, SubmitError, SubmitRequest, CLOSE_NORMAL,
    CLOSE_PROJECT_UNKNOWN, CLOSE_SLOW_CONSUMER, CLOSE_UNAUTHORIZED, KEEPALIVE_PING, KEEPALIVE_PONG,
    MAX_INSTRUCTION_BYTES,
};
pub use event::{AgentKind, CanonicalEvent, ErrorKind, RunMetrics, StatusPhase, UnknownAgent};
pub use message::{MessageRole, MessageStore, StoreError, StoredMessage};
pub use session::{project_sessions, ProjectSessions, SessionState};
