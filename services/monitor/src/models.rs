//! Records persisted by the monitor and the rules for building them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Hard cap on the number of records returned by a recent-records query.
pub const RECENT_LIMIT: i64 = 50;

/// Location stored when the upload form omits one
pub const DEFAULT_LOCATION: &str = "Unknown";

/// Confidence stored when the upload form omits one or sends garbage
pub const DEFAULT_CONFIDENCE: f64 = 1.0;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub topic: String,
    /// Payload as received, decoded lossily as UTF-8
    #[serde(rename = "message")]
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Geographic position attached to a detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// An uploaded image with its location and confidence score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Base64 encoded image bytes
    pub image: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub confidence: f64,
}

/// Detection fields ready for insertion; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
    pub image: String,
    pub location: String,
    pub coordinates: Option<Coordinates>,
    pub confidence: f64,
}

/// Raw text fields of an upload form, exactly as the client sent them.
#[derive(Debug, Clone, Default)]
pub struct DetectionFields {
    pub location: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub confidence: Option<String>,
}

impl DetectionFields {
    /// Apply the insertion defaults and pair the fields with an encoded image.
    ///
    /// Missing or unparseable coordinates become `0.0`, a missing or
    /// unparseable confidence becomes [`DEFAULT_CONFIDENCE`]. None of these
    /// fields can make the upload fail.
    pub fn into_new_detection(self, image: String) -> NewDetection {
        let latitude = parse_float(self.latitude.as_deref()).unwrap_or(0.0);
        let longitude = parse_float(self.longitude.as_deref()).unwrap_or(0.0);
        let confidence =
            parse_float(self.confidence.as_deref()).unwrap_or(DEFAULT_CONFIDENCE);

        let location = self
            .location
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());

        NewDetection {
            image,
            location,
            coordinates: Some(Coordinates {
                latitude,
                longitude,
            }),
            confidence,
        }
    }
}

/// Parse a form float, treating empty, malformed, and non-finite input as absent
fn parse_float(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// The two record collections held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Messages,
    Detections,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Messages => "messages",
            Collection::Detections => "detections",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A record returned by a recent-records query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Message(Message),
    Detection(Detection),
}

impl Record {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Message(m) => m.timestamp,
            Record::Detection(d) => d.timestamp,
        }
    }
}

/// Clamp a requested result size into `1..=RECENT_LIMIT`
pub fn clamp_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(RECENT_LIMIT).clamp(1, RECENT_LIMIT)
}
