//! Progress reporting: snapshots, their broadcast, and display helpers.

mod bus;
mod format;
mod speed;
mod throttle;
mod types;

pub use bus::{spawn_progress_logger, ProgressBus};
pub use format::{eta_secs, format_bytes, format_eta, format_rate};
pub use speed::SpeedTracker;
pub use throttle::ProgressThrottle;
pub use types::{composite_percent, ProgressSnapshot};
