//! # MAGIC North-Bound Protocol
//!
//! Diameter-style request/answer protocol between cabin/avionics clients
//! and the Connection Manager Core.
//!
//! This crate is pure codec — no I/O:
//! - **AVP layer** — attribute-value pairs with explicit network-byte-order
//!   encode/decode and the self-framing message header ([`avp`])
//! - **Dictionary** — the catalog of commands and attributes, with
//!   mandatory-flag and value-kind validation ([`dictionary`])
//! - **Commands** — the typed MCAR/MCAA, MCCR/MCCA, MNTR/MNTA, MSCR/MSCA
//!   vocabulary with one sum type per direction ([`commands`])
//! - **Codes** — Result-Code and MAGIC-Status-Code enumerations ([`codes`])
//!
//! A missing or unknown type code is a protocol error answered with a
//! structured failure; nothing in this crate guesses.

pub mod avp;
pub mod codes;
pub mod commands;
pub mod dictionary;

pub use avp::{Avp, AvpValue, Message, ProtoError};
pub use codes::{MagicStatus, ResultCode};
pub use commands::{ClientCommand, ServerMessage};
pub use dictionary::{dictionary, AvpType, MAGIC_APPLICATION_ID, MAGIC_VENDOR_ID};
