//! Client discovery on online devices

pub mod pids;
pub mod tracker;

pub use pids::{PidDiff, diff_pids, parse_pid_list};
pub use tracker::TrackerHandle;
