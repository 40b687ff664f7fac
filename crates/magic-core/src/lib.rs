//! # MAGIC Connection Manager Core
//!
//! The single process that manages an aircraft's heterogeneous data links:
//!
//! - terminates the Diameter-style client protocol (north-bound, TCP)
//! - speaks MIH to the Data Link Managers over local IPC (south-bound)
//! - keeps per-client session state and per-link capability state
//! - runs the policy engine that maps a request to a link and a grant
//! - pushes MNTR/MSCR notifications to subscribed clients as links change
//!
//! The library exposes every component for testing; the `magic-core` binary
//! wires them into a daemon.

pub mod adif;
pub mod config;
pub mod error;
pub mod ids;
pub mod liveness;
pub mod north;
pub mod policy;
pub mod push;
pub mod registry;
pub mod south;
pub mod state;

pub use config::Config;
pub use error::RegistryError;
pub use state::CoreState;
