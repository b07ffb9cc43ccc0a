use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::classifier;

pub const INBOUND_QUEUE: &str = "rssi_queue";
pub const OUTBOUND_QUEUE: &str = "result_queue";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed measurement: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode classification result: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One RSSI reading as received on the inbound queue.
///
/// Both fields are optional; anything else in the body is ignored.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Measurement {
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl Measurement {
    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        // serde would also accept a positional array for a struct
        let value: Value = serde_json::from_slice(body).map_err(CodecError::Decode)?;
        if !value.is_object() {
            return Err(CodecError::Decode(serde::de::Error::custom(
                "expected a JSON object",
            )));
        }
        serde_json::from_value(value).map_err(CodecError::Decode)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Attendance {
    Present,
    Absent,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub attendance: Attendance,
    pub timestamp: Option<Value>,
}

impl ClassificationResult {
    pub fn from_measurement(measurement: &Measurement) -> Self {
        ClassificationResult {
            attendance: classifier::classify(measurement.rssi),
            timestamp: measurement.timestamp.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }
}
