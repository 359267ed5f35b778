//! Monitoring daemon: raw event intake, classification, alert dispatch and
//! the loop that ties them to the baseline store.

pub mod alert;
pub mod integrity;
pub mod monitor;

pub use monitor::{Monitor, MonitorError, MonitorHandle, MonitorState, PathState};
