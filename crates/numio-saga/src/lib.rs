//! The order orchestrator: the purchase saga plus cancel, resend, and
//! status queries.
//!
//! The saga composes wallet, catalog, kernel, and provider adapter into the
//! purchase protocol. Its branches are tagged outcomes, not exceptions; the
//! one hard rule is that an error after the upstream acquire must queue a
//! compensation before surfacing.

pub mod orchestrator;
pub mod status;

pub use orchestrator::{Orchestrator, PurchaseOutcome, PurchaseRequest};
pub use status::OrderStatus;
