//! Reply payloads published back to requesters

use crate::error::ServeError;
use crate::labels::CarDescriptor;
use crate::models::host::Prediction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Successful classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictReply {
    /// Identifier echoed in logs
    pub request_id: Uuid,

    /// Predicted class name, e.g. "BMW M5 Sedan 2010"
    pub pred_class: String,

    /// Index of the class in the label table
    pub class_id: usize,

    /// Make/model/year split of `pred_class`, when it parses
    pub car: Option<CarDescriptor>,

    /// Time spent serving the request
    pub latency_ms: u64,

    pub timestamp: DateTime<Utc>,
}

impl PredictReply {
    pub fn new(request_id: Uuid, prediction: Prediction, latency: Duration) -> Self {
        Self {
            request_id,
            car: CarDescriptor::parse(&prediction.label),
            pred_class: prediction.label,
            class_id: prediction.class_id,
            latency_ms: latency.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

/// Failed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub request_id: Uuid,

    /// HTTP-style status: 400 bad image, 503 weights unavailable, 500 otherwise
    pub status: u16,

    /// Error kind, e.g. "image_decode"
    pub kind: String,

    pub detail: String,

    pub timestamp: DateTime<Utc>,
}

impl ErrorReply {
    pub fn from_error(request_id: Uuid, error: &ServeError) -> Self {
        Self {
            request_id,
            status: error.status_code(),
            kind: error.kind().to_string(),
            detail: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Acknowledgement of a manual cache clear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearReply {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl ClearReply {
    pub fn cleared() -> Self {
        Self {
            status: "cache cleared".to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_reply_carries_car() {
        let reply = PredictReply::new(
            Uuid::new_v4(),
            Prediction {
                class_id: 7,
                label: "BMW M5 Sedan 2010".to_string(),
            },
            Duration::from_millis(42),
        );

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["pred_class"], "BMW M5 Sedan 2010");
        assert_eq!(json["class_id"], 7);
        assert_eq!(json["car"]["make"], "BMW");
        assert_eq!(json["car"]["year"], 2010);
        assert_eq!(json["latency_ms"], 42);
    }

    #[test]
    fn test_error_reply() {
        let id = Uuid::new_v4();
        let reply = ErrorReply::from_error(id, &ServeError::ImageDecode("bad magic".to_string()));

        let json = serde_json::to_string(&reply).unwrap();
        let parsed: ErrorReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, id);
        assert_eq!(parsed.status, 400);
        assert_eq!(parsed.kind, "image_decode");
        assert_eq!(parsed.detail, "image decode failed: bad magic");
    }
}
