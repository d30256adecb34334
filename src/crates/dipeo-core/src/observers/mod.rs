//! Pure event-bus observers.
//!
//! None of these take engine references; everything they know arrives on the
//! bus. The state-persistence subscriber runs at high priority (state is
//! durable before the UI hears about it); metrics, streaming, and logging
//! run at normal priority.

pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod persistence;

pub use logging::LoggingObserver;
pub use metrics::{ExecutionMetrics, MetricsObserver, NodeMetrics, METRICS_OBSERVER};
pub use monitor::StreamingMonitor;
pub use persistence::StatePersistenceSubscriber;
