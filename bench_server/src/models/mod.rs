//! Benchmark results data models.

pub mod benchmark;
pub mod environment;
pub mod manifest;
pub mod result;
pub mod result_data;
pub mod task;
pub mod test_job;
