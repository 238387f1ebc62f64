pub mod extract;
pub mod stream;

pub use extract::{AnswerResult, TranscriptionResult};
pub use stream::{AnswerStream, AnswerStreamEvent, StreamCanceller, StreamProgress};

use crate::error::{CaptureError, ClientError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

const NO_RESPONSE: &str = "No response received.";

/// Operations of the question-answering service.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    /// `POST /api/ask`
    async fn ask(&self, question: &str) -> Result<String, ClientError>;

    /// `POST /api/ask/stream`. Fails before any event on a non-2xx status.
    async fn ask_stream(&self, question: &str) -> Result<AnswerStream, ClientError>;

    /// `POST /api/transcribe`
    async fn transcribe(&self, audio: &Path) -> Result<TranscriptionResult, ClientError>;

    /// `POST /api/speech-to-answer`
    async fn speech_to_answer(&self, audio: &Path) -> Result<AnswerResult, ClientError>;
}

#[derive(Serialize)]
struct QuestionRequest<'a> {
    question: &'a str,
}

#[derive(Deserialize)]
struct AnswerResponse {
    #[serde(default)]
    answer: Option<String>,
}

/// HTTP client for the service
///
/// The base URL is read once at the start of each call, so updates apply to
/// the next call and never to one in flight.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: watch::Receiver<String>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: watch::Receiver<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, ClientError> {
        let base = self.base_url.borrow().trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(ClientError::NotConfigured);
        }
        Ok(format!("{}{}", base, path))
    }

    async fn post_audio(&self, path: &str, audio: &Path) -> Result<String, ClientError> {
        let url = self.endpoint(path)?;

        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| CaptureError::Io(format!("failed to read {}: {}", audio.display(), e)))?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.wav".to_string());

        tracing::debug!(url = %url, bytes = bytes.len(), "Uploading audio");

        let file_part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")?;
        let form = Form::new().part("file", file_part);

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response.text().await?)
    }
}

#[async_trait]
impl AssistantApi for ApiClient {
    async fn ask(&self, question: &str) -> Result<String, ClientError> {
        let url = self.endpoint("/api/ask")?;
        tracing::debug!(url = %url, "Asking question");

        let response = self
            .http
            .post(&url)
            .json(&QuestionRequest { question })
            .timeout(self.timeout)
            .send()
            .await?;
        let response = check_status(response).await?;

        let body: AnswerResponse = response.json().await?;
        Ok(body.answer.unwrap_or_else(|| NO_RESPONSE.to_string()))
    }

    async fn ask_stream(&self, question: &str) -> Result<AnswerStream, ClientError> {
        let url = self.endpoint("/api/ask/stream")?;
        tracing::debug!(url = %url, "Opening answer stream");

        // Only the wait for headers is bounded; a long answer may stream for longer.
        let request = self.http.post(&url).json(&QuestionRequest { question }).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ClientError::Timeout)??;
        let response = check_status(response).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from));
        Ok(AnswerStream::new(body))
    }

    async fn transcribe(&self, audio: &Path) -> Result<TranscriptionResult, ClientError> {
        let body = self.post_audio("/api/transcribe", audio).await?;
        let result = TranscriptionResult::parse(&body)?;
        tracing::info!("Transcription complete: {} chars", result.text.len());
        Ok(result)
    }

    async fn speech_to_answer(&self, audio: &Path) -> Result<AnswerResult, ClientError> {
        let body = self.post_audio("/api/speech-to-answer", audio).await?;
        Ok(AnswerResult::parse(&body)?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!("Request failed with status {}: {}", status, body);
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}
