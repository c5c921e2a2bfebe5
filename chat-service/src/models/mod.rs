//! Domain models for the chat service.

pub mod payload;
pub mod session;

pub use payload::{ClientMetadata, ValidatedPayload, ValidationPolicy, validate_payload};
pub use session::{ChatSession, ChatTurn, Role};
