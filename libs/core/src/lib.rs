//! Core domain types shared by every Trimline service crate.
//!
//! Everything here is transport- and storage-agnostic: session states,
//! outbound message shapes, the error taxonomy, phone normalization,
//! template rendering and the in-process event bridge.

mod error;
mod events;
mod phone;
mod template;
mod types;

pub use error::CoreError;
pub use events::{BridgeEvent, EventBridge, SnapshotSink};
pub use phone::normalize_recipient;
pub use template::{format_price_cents, render_template, TemplateVars};
pub use types::*;
