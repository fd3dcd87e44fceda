use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::WorkflowError;

/// Largest accepted upload: 10 MiB.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// A validated image. Only the validator constructs these, so every handle
/// has an `image/*` type and fits within [`MAX_IMAGE_BYTES`].
///
/// The bytes are immutable once validated. Clones held by the workflow state
/// and the encoder share one read-only buffer; nothing copies or rewrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    name: String,
    mime: String,
    bytes: Arc<[u8]>,
}

impl ImageHandle {
    pub(crate) fn new(name: String, mime: String, bytes: Vec<u8>) -> Self {
        Self {
            name,
            mime,
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Bare base64 body of one image, without any `data:` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload(String);

impl EncodedPayload {
    /// Returns `None` for an empty body.
    pub fn new(encoded: String) -> Option<Self> {
        if encoded.is_empty() {
            None
        } else {
            Some(Self(encoded))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// One classification returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    /// Percentages in `0..=100`.
    pub probabilities: Vec<f64>,
    /// Label to index into `probabilities`, in the order the server sent them.
    pub class_dictionary: Vec<(String, usize)>,
}

/// Empty when the server found no usable face.
pub type ClassificationResponse = Vec<Prediction>;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub label: String,
    pub probability: f64,
}

/// Labels ordered by probability, highest first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RankedResult(Vec<RankedEntry>);

impl RankedResult {
    pub(crate) fn new(entries: Vec<RankedEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[RankedEntry] {
        &self.0
    }

    pub fn top(&self, n: usize) -> &[RankedEntry] {
        &self.0[..n.min(self.0.len())]
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A successful classification, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub request_id: Uuid,
    pub label: String,
    pub ranked: RankedResult,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Ready,
    Loading,
    Success,
    Failed,
}

/// Snapshot of the workflow, published whole on every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum WorkflowState {
    #[default]
    Idle,
    Ready {
        image: ImageHandle,
    },
    Loading {
        image: ImageHandle,
    },
    Success {
        image: ImageHandle,
        outcome: Classification,
    },
    Failed {
        image: Option<ImageHandle>,
        error: WorkflowError,
    },
}

impl WorkflowState {
    pub fn phase(&self) -> Phase {
        match self {
            WorkflowState::Idle => Phase::Idle,
            WorkflowState::Ready { .. } => Phase::Ready,
            WorkflowState::Loading { .. } => Phase::Loading,
            WorkflowState::Success { .. } => Phase::Success,
            WorkflowState::Failed { .. } => Phase::Failed,
        }
    }

    pub fn image(&self) -> Option<&ImageHandle> {
        match self {
            WorkflowState::Idle => None,
            WorkflowState::Ready { image }
            | WorkflowState::Loading { image }
            | WorkflowState::Success { image, .. } => Some(image),
            WorkflowState::Failed { image, .. } => image.as_ref(),
        }
    }

    pub fn outcome(&self) -> Option<&Classification> {
        match self {
            WorkflowState::Success { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    pub fn ranked(&self) -> Option<&RankedResult> {
        self.outcome().map(|outcome| &outcome.ranked)
    }

    pub fn winning_label(&self) -> Option<&str> {
        self.outcome().map(|outcome| outcome.label.as_str())
    }

    pub fn error(&self) -> Option<&WorkflowError> {
        match self {
            WorkflowState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error().map(ToString::to_string)
    }
}
