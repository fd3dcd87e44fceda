use thiserror::Error;

use crate::types::MAX_IMAGE_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("declared type {mime:?} is not an image type")]
    NotAnImage { mime: String },

    #[error("image is {size} bytes, limit is {}", MAX_IMAGE_BYTES)]
    TooLarge { size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to encode image: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("classification server responded with status {0}")]
    Server(u16),

    #[error("unexpected response body: {0}")]
    Malformed(String),

    #[error("request failed: {0}")]
    Connection(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ClientError::Server(status.as_u16()),
            None => ClientError::Connection(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankError {
    #[error("label {label:?} points at index {index}, but only {len} probabilities were returned")]
    IndexOutOfRange {
        label: String,
        index: usize,
        len: usize,
    },
}

/// Failures surfaced to the presentation layer. `Display` is the message
/// shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Please upload a valid image file")]
    NotAnImage,

    #[error("Image size should be less than 10MB")]
    TooLarge,

    #[error("Could not prepare the image for upload: {0}")]
    EncodingFailed(String),

    #[error("Server error: {0}")]
    ServerError(u16),

    #[error("The classification server sent an unexpected response: {0}")]
    MalformedResponse(String),

    #[error("No face with 2 eyes detected in the image")]
    NoFaceDetected,

    #[error("Error while classifying image. Make sure the server is running.")]
    ConnectionFailed(String),
}

impl WorkflowError {
    /// Stable name used as a metrics label and in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::NotAnImage => "not_an_image",
            WorkflowError::TooLarge => "too_large",
            WorkflowError::EncodingFailed(_) => "encoding_failed",
            WorkflowError::ServerError(_) => "server_error",
            WorkflowError::MalformedResponse(_) => "malformed_response",
            WorkflowError::NoFaceDetected => "no_face_detected",
            WorkflowError::ConnectionFailed(_) => "connection_failed",
        }
    }
}

impl From<ValidationError> for WorkflowError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::NotAnImage { .. } => WorkflowError::NotAnImage,
            ValidationError::TooLarge { .. } => WorkflowError::TooLarge,
        }
    }
}

impl From<EncodeError> for WorkflowError {
    fn from(err: EncodeError) -> Self {
        WorkflowError::EncodingFailed(err.0)
    }
}

impl From<ClientError> for WorkflowError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Server(code) => WorkflowError::ServerError(code),
            ClientError::Malformed(detail) => WorkflowError::MalformedResponse(detail),
            ClientError::Connection(detail) => WorkflowError::ConnectionFailed(detail),
        }
    }
}

impl From<RankError> for WorkflowError {
    fn from(err: RankError) -> Self {
        WorkflowError::MalformedResponse(err.to_string())
    }
}

/// Commands the controller refuses without changing state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Please upload an image first")]
    NoImage,

    #[error("A classification is already in progress")]
    AlreadyLoading,

    #[error("Workflow controller has stopped")]
    ControllerStopped,
}
