use crate::messages::Attendance;

/// Readings strictly above this are considered in range.
pub const PRESENCE_THRESHOLD_DBM: f64 = -70.0;

/// Used when a measurement carries no RSSI at all.
pub const DEFAULT_RSSI_DBM: f64 = -100.0;

pub fn classify(rssi: Option<f64>) -> Attendance {
    if rssi.unwrap_or(DEFAULT_RSSI_DBM) > PRESENCE_THRESHOLD_DBM {
        Attendance::Present
    } else {
        Attendance::Absent
    }
}
