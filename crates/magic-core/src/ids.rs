//! Prefixed session-id generation.
//!
//! Session ids are `ses_` + UUIDv7: globally unique, time-ordered, and
//! recognisable in logs.

use uuid::Uuid;

/// Generate a session id: `ses_<uuid7>`.
pub fn session_id() -> String {
    format!("ses_{}", Uuid::now_v7().as_simple())
}
