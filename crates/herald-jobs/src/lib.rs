//! Job tracking for Herald.
//!
//! [`JobStore`] holds one [`ProcessingJob`](herald_types::ProcessingJob) per id
//! and applies lifecycle events with upsert semantics. [`JobEventRouter`] keeps
//! a reconnecting subscription to the job event stream and feeds the store.

pub mod store;
pub mod router;

pub use store::{JobStore, JobUpdate};
pub use router::{JobEventRouter, JobRouterConfig};
