//! Wire models for the segmentation platform API.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Result of a successful creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSegment {
    pub external_id: String,
}

/// A segment as reported by the platform's list endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteSegment {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateSegmentResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListSegmentsResponse {
    pub segments: Vec<RemoteSegment>,
}
