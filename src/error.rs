use thiserror::Error;

use crate::api::extract::ExtractError;

/// Errors from the request workflows.
///
/// Every variant is recovered at the workflow boundary and rendered with
/// [`ClientError::user_message`]; none of them end the process.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("API URL is not configured")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("stream error: {0}")]
    StreamProtocol(String),

    #[error(transparent)]
    FieldExtraction(#[from] ExtractError),

    #[error("malformed response body: {0}")]
    Decode(String),

    #[error("capture: {0}")]
    Capture(#[from] CaptureError),

    #[error("another request is already in progress")]
    Busy,

    #[error("no recording to process")]
    NoRecording,
}

impl ClientError {
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConfigured => {
                "Error: API URL is not configured. Please set the API URL in settings.".to_string()
            }
            Self::Transport(msg) => format!(
                "API connection error: {}\n\nPlease verify the API URL and ensure the server is running.",
                msg
            ),
            Self::Status { status, .. } => format!(
                "API connection error: server responded with status {}.\n\nPlease verify the API URL and ensure the server is running.",
                status
            ),
            Self::Timeout => "Request timed out. The server took too long to respond.".to_string(),
            Self::StreamProtocol(msg) => format!("Stream error: {}", msg),
            Self::FieldExtraction(_) | Self::Decode(_) => {
                "Could not parse the server response.".to_string()
            }
            Self::Capture(e) => e.user_message(),
            Self::Busy => "Please wait for the current request to finish.".to_string(),
            Self::NoRecording => "No recording to process.".to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Microphone capture and recording file errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("no recording is in progress")]
    NotRecording,

    #[error("no input audio device available")]
    NoInputDevice,

    #[error("input device error: {0}")]
    Device(String),

    #[error("failed to write recording: {0}")]
    Write(String),

    #[error("recording file error: {0}")]
    Io(String),

    #[error("recorder is not running")]
    RecorderUnavailable,
}

impl CaptureError {
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyRecording => "Recording is already in progress.".to_string(),
            Self::NotRecording => "Recording has not been started.".to_string(),
            Self::NoInputDevice => "Recording error: no microphone found.".to_string(),
            Self::Device(msg) => format!("Recording error: {}", msg),
            Self::Write(msg) => format!("Recording error: could not save audio ({})", msg),
            Self::Io(msg) => format!("Recording error: {}", msg),
            Self::RecorderUnavailable => "Recording error: recorder is not running.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_has_a_user_message() {
        let errors = [
            ClientError::NotConfigured,
            ClientError::Transport("refused".to_string()),
            ClientError::Status {
                status: 502,
                body: String::new(),
            },
            ClientError::Timeout,
            ClientError::StreamProtocol("boom".to_string()),
            ClientError::FieldExtraction(ExtractError::FieldNotFound("text".to_string())),
            ClientError::Decode("expected value".to_string()),
            ClientError::Capture(CaptureError::NoInputDevice),
            ClientError::Busy,
            ClientError::NoRecording,
        ];
        for err in errors {
            assert!(!err.user_message().is_empty(), "{:?}", err);
        }
    }

    #[test]
    fn stream_error_message_carries_payload() {
        let err = ClientError::StreamProtocol("boom".to_string());
        assert_eq!(err.user_message(), "Stream error: boom");
    }

    #[test]
    fn capture_errors_convert() {
        let err: ClientError = CaptureError::AlreadyRecording.into();
        assert!(matches!(err, ClientError::Capture(CaptureError::AlreadyRecording)));
        assert_eq!(err.user_message(), "Recording is already in progress.");
    }
}
