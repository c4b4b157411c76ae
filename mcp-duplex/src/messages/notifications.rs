//! Payloads of the built-in `notifications/cancelled` and
//! `notifications/progress` notifications.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RequestId;

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Id of the request the sender gave up on
    pub request_id: RequestId,

    /// Why it was cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Params of `notifications/progress`.
///
/// The token is the id of the request the progress belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token that routes this notification to a progress callback
    pub progress_token: RequestId,

    /// Progress payload without the token
    #[serde(flatten)]
    pub progress: Progress,
}

/// Progress payload handed to a progress callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Progress so far
    pub progress: f64,

    /// Total amount of work, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,

    /// Any other fields the sender included
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Progress {
    /// Progress with an optional total and no extra fields.
    pub fn new(progress: f64, total: Option<f64>) -> Self {
        Self {
            progress,
            total,
            extra: Map::new(),
        }
    }
}
