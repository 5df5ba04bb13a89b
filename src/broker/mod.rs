//! Job broker
//!
//! Durable queue storage plus a health guard that sheds load when the
//! storage layer starts failing.

mod guard;
mod store;

pub use guard::{BrokerGuard, GuardState};
pub use store::{DeadLetter, JobStore, QueueCounts};
