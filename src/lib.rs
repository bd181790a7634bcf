//! Box lifecycle and request-serialization subsystem for a multi-tenant
//! `isolate`-backed code execution service.
//!
//! This crate owns the parts of that service with real engineering content:
//! concurrency coordination over a scarce shared resource (a fixed pool of
//! sandbox "boxes"), retry/recovery against an external tool that can leave
//! dirty state behind, and translation between the isolator's key:value
//! vocabulary and a typed Rust one. The HTTP façade, the language registry,
//! and the outer job queue are someone else's problem; [`language::LanguageSpec`]
//! is the boundary the former would implement against.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod language;
pub mod meta;
pub mod process;
pub mod registry;
pub mod session;

use std::fmt;

/// A sandbox slot in `[0, num_boxes)`. Newtyped over `u32` so it can't be
/// confused with other small integers (worker ids, test indices) floating
/// around a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxId(pub u32);

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for BoxId {
    fn from(value: u32) -> Self {
        BoxId(value)
    }
}

impl From<BoxId> for u32 {
    fn from(value: BoxId) -> Self {
        value.0
    }
}

pub use acquisition::{acquire_box, with_box, BoxLease, DEFAULT_ACQUIRE_TIMEOUT};
pub use error::IsolateError;
pub use meta::{MetaRecord, MetaStatus};
pub use process::{IsolateProcessDriver, ProcessDriver};
pub use session::{IsolatorSession, OptionSet, ResultRecord};
