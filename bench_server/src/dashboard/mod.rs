//! Dashboard queries: per-result summaries for the charts.

pub mod summary;
