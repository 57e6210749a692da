//! Counters for overlay streams and the shared buffer allocator.
//!
//! Everything is an atomic counter updated in place and read through a
//! point-in-time snapshot struct.

pub mod admission;
pub mod stream;

pub use admission::{AdmissionMetrics, AdmissionMetricsSnapshot};
pub use stream::{StreamMetrics, StreamMetricsSnapshot};
