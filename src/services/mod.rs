//! Background services

pub mod lag_monitor;
pub mod throttle_cleanup;

pub use lag_monitor::{LagMonitor, LagMonitorHandle};
pub use throttle_cleanup::{ThrottleCleanupHandle, ThrottleCleanupService};
