//! Lifecycle events for tracked entities.
//!
//! Test jobs move through runner-reported states; events are folded into an
//! aggregate before the row is written back.

pub mod test_job;
