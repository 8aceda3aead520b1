//! The unified poll manager: adaptive, batched, provider-grouped polling of
//! due activations, driven by the time-ordered due-index.

pub mod breaker;
pub mod manager;
pub mod schedule;

pub use breaker::CircuitBreaker;
pub use manager::{CycleReport, PollManager};
pub use schedule::{next_poll, PollPhase, ScheduleDecision, ScheduleInput};
