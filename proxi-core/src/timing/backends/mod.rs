//! Timer backend implementations
//!
//! - `MockTimerBackend`: records scheduled timers, fires them on demand
//!
//! Async hosts use the tokio backend in `proxi-engine`.

mod mock;

pub use mock::{MockTimerBackend, RecordedTimer};
