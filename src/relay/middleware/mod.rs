//! Admission control: per-client throttling and the proxyless burst limiter

mod burst_limit;
mod throttle;

pub use burst_limit::{Admission, BurstLimiter};
pub use throttle::ClientThrottle;
