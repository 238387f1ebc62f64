use crate::api::{AnswerStreamEvent, AssistantApi, StreamCanceller, StreamProgress};
use crate::error::{CaptureError, ClientError};
use crate::messages::{CaptureState, RecordingSession, ViewState};
use crate::services::RecorderHandle;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const EMPTY_PROMPT: &str = "Please enter a question first.";
const WAITING: &str = "Waiting for response...";
const RECEIVING: &str = "Receiving answer...";
const TRANSCRIBE_DONE: &str = "Audio transcription complete. You can edit the text before sending.";
const TRANSCRIBE_PARSE_FAILED: &str = "Error parsing transcription response.";
const TRANSCRIBE_FAILED: &str = "Error during transcription.";
const COMBINED_PARSE_FAILED: &str = "Error parsing response.";
const NO_ANSWER: &str = "Could not retrieve answer from server.";
const NO_TRANSCRIPT: &str = "Could not transcribe the recording.";
const VOICE_FAILED: &str = "Error processing voice request.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// Transcript goes to the prompt for editing
    #[default]
    TranscribeOnly,
    TranscribeAndRespond,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Immediate,
    #[default]
    Streamed,
}

/// The user's workflow selection.
///
/// Delivery is a single value, so Streamed and Immediate exclude each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceSettings {
    pub mode: VoiceMode,
    pub delivery: DeliveryMode,
}

impl VoiceSettings {
    pub fn is_streamed(&self) -> bool {
        self.delivery == DeliveryMode::Streamed
    }

    /// Clearing streamed delivery selects immediate, and the reverse.
    pub fn set_streamed(&mut self, streamed: bool) {
        self.delivery = if streamed {
            DeliveryMode::Streamed
        } else {
            DeliveryMode::Immediate
        };
    }
}

/// Cancels whichever answer stream the orchestrator has open.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<Mutex<Option<StreamCanceller>>>);

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        match self.0.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(canceller) => {
                    canceller.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn set(&self, canceller: Option<StreamCanceller>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = canceller;
        }
    }
}

/// Holds `busy` for one workflow and restores the display defaults when dropped.
struct BusyGuard<'a> {
    view: &'a watch::Sender<ViewState>,
}

impl<'a> BusyGuard<'a> {
    fn acquire(view: &'a watch::Sender<ViewState>) -> Result<Self, ClientError> {
        let acquired = view.send_if_modified(|v| {
            if v.busy {
                false
            } else {
                v.busy = true;
                true
            }
        });
        if acquired {
            Ok(Self { view })
        } else {
            Err(ClientError::Busy)
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.view.send_modify(|v| {
            v.busy = false;
            v.waiting_for_first_chunk = false;
            v.currently_streaming = false;
            v.simple_answer_shown = true;
        });
    }
}

/// Drives recording, transcription and answer retrieval, publishing every
/// change to a [`ViewState`] watch channel.
pub struct VoiceOrchestrator<A> {
    api: A,
    recorder: RecorderHandle,
    view: watch::Sender<ViewState>,
    settings: VoiceSettings,
    recording: Option<RecordingSession>,
    active_stream: CancelHandle,
}

impl<A: AssistantApi> VoiceOrchestrator<A> {
    pub fn new(
        api: A,
        recorder: RecorderHandle,
        view: watch::Sender<ViewState>,
        settings: VoiceSettings,
    ) -> Self {
        Self {
            api,
            recorder,
            view,
            settings,
            recording: None,
            active_stream: CancelHandle::default(),
        }
    }

    pub fn settings(&self) -> VoiceSettings {
        self.settings
    }

    pub fn set_voice_mode(&mut self, mode: VoiceMode) {
        self.settings.mode = mode;
    }

    pub fn set_streamed(&mut self, streamed: bool) {
        self.settings.set_streamed(streamed);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.active_stream.clone()
    }

    pub fn set_prompt(&self, prompt: &str) {
        let prompt = prompt.to_string();
        self.view.send_modify(|v| v.prompt = prompt);
    }

    pub fn clear_prompt(&self) {
        self.view.send_modify(|v| {
            v.prompt.clear();
            v.answer.clear();
        });
    }

    /// Ask the current prompt, streamed or immediate per the delivery setting.
    pub async fn send_prompt(&self) -> Result<(), ClientError> {
        let prompt = self.view.borrow().prompt.trim().to_string();
        if prompt.is_empty() {
            self.view.send_modify(|v| v.answer = EMPTY_PROMPT.to_string());
            return Ok(());
        }

        let _busy = BusyGuard::acquire(&self.view)?;

        let result = if self.settings.is_streamed() {
            self.stream_answer(&prompt).await
        } else {
            self.view.send_modify(|v| v.answer = WAITING.to_string());
            self.api.ask(&prompt).await
        };

        match result {
            Ok(answer) => {
                self.view.send_modify(|v| v.answer = answer);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Question failed: {}", e);
                let message = e.user_message();
                self.view.send_modify(|v| v.answer = message);
                Err(e)
            }
        }
    }

    pub async fn start_recording(&mut self) -> Result<(), ClientError> {
        if self.view.borrow().busy {
            return Err(ClientError::Busy);
        }

        self.view.send_modify(|v| {
            v.transcript.clear();
            v.answer.clear();
            v.notice.clear();
        });

        let result = self.recorder.start().await;
        let capture = self.recorder.state();
        match result {
            Ok(session) => {
                tracing::info!("Recording to {:?}", session.file_path);
                // The previous recording is released; its file stays on disk
                self.recording = None;
                self.view.send_modify(|v| {
                    v.capture = capture;
                    v.recording = None;
                    v.notice = "Recording...".to_string();
                });
                Ok(())
            }
            Err(e) => {
                let message = e.user_message();
                self.view.send_modify(|v| {
                    v.capture = capture;
                    v.notice = message;
                });
                Err(e.into())
            }
        }
    }

    pub async fn stop_recording(&mut self) -> Result<(), ClientError> {
        let result = self.recorder.stop().await;
        let capture = self.recorder.state();
        match result {
            Ok(session) => {
                let path = session.file_path.clone();
                self.recording = Some(session);
                self.view.send_modify(|v| {
                    v.capture = capture;
                    v.recording = Some(path);
                    v.notice = "Recording complete.".to_string();
                });
                Ok(())
            }
            Err(e) => {
                let message = e.user_message();
                self.view.send_modify(|v| {
                    v.capture = capture;
                    v.notice = message;
                });
                Err(e.into())
            }
        }
    }

    /// Run the selected voice workflow on the last finished recording.
    ///
    /// The recording is consumed; its file stays on disk.
    pub async fn process_voice(&mut self) -> Result<(), ClientError> {
        if self.view.borrow().busy {
            return Err(ClientError::Busy);
        }
        if self.recorder.state() == CaptureState::Recording {
            let err = ClientError::from(CaptureError::AlreadyRecording);
            let message = err.user_message();
            self.view.send_modify(|v| v.notice = message);
            return Err(err);
        }

        let session = match self.recording.take() {
            Some(session) if session.file_path.exists() => session,
            _ => {
                let message = ClientError::NoRecording.user_message();
                self.view.send_modify(|v| {
                    v.answer = message;
                    v.recording = None;
                });
                return Err(ClientError::NoRecording);
            }
        };
        self.view.send_modify(|v| v.recording = None);

        tracing::info!("Processing recording {}", session.id);
        self.process_recording(&session.file_path).await
    }

    pub async fn process_recording(&self, audio: &Path) -> Result<(), ClientError> {
        let _busy = BusyGuard::acquire(&self.view)?;

        self.view.send_modify(|v| {
            v.transcript.clear();
            v.answer.clear();
            v.notice.clear();
        });

        match (self.settings.mode, self.settings.delivery) {
            (VoiceMode::TranscribeOnly, _) => self.transcribe_to_prompt(audio).await,
            (VoiceMode::TranscribeAndRespond, DeliveryMode::Immediate) => {
                self.transcribe_and_answer(audio).await
            }
            (VoiceMode::TranscribeAndRespond, DeliveryMode::Streamed) => {
                self.transcribe_and_stream(audio).await
            }
        }
    }

    async fn transcribe_to_prompt(&self, audio: &Path) -> Result<(), ClientError> {
        match self.api.transcribe(audio).await {
            Ok(result) => {
                tracing::info!("Transcription: {}", result.text);
                self.view.send_modify(|v| {
                    v.transcript = result.text.clone();
                    v.prompt = result.text;
                    v.notice = TRANSCRIBE_DONE.to_string();
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Transcription failed: {}", e);
                let message = e.user_message();
                self.view.send_modify(|v| match &e {
                    ClientError::FieldExtraction(_) => {
                        v.transcript = TRANSCRIBE_PARSE_FAILED.to_string()
                    }
                    _ => {
                        v.transcript = TRANSCRIBE_FAILED.to_string();
                        v.notice = message;
                    }
                });
                Err(e)
            }
        }
    }

    async fn transcribe_and_answer(&self, audio: &Path) -> Result<(), ClientError> {
        self.view.send_modify(|v| v.answer = WAITING.to_string());

        match self.api.speech_to_answer(audio).await {
            Ok(result) => {
                self.view.send_modify(|v| {
                    v.transcript = result.transcription;
                    v.answer = result.answer;
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Voice request failed: {}", e);
                let message = e.user_message();
                self.view.send_modify(|v| match &e {
                    ClientError::FieldExtraction(_) => {
                        v.transcript = COMBINED_PARSE_FAILED.to_string();
                        v.answer = NO_ANSWER.to_string();
                    }
                    _ => {
                        v.transcript = VOICE_FAILED.to_string();
                        v.answer = message;
                    }
                });
                Err(e)
            }
        }
    }

    async fn transcribe_and_stream(&self, audio: &Path) -> Result<(), ClientError> {
        let transcript = match self.api.transcribe(audio).await {
            Ok(result) => result.text,
            Err(e) => {
                tracing::warn!("Transcription failed: {}", e);
                let (transcript, message) = match &e {
                    ClientError::FieldExtraction(_) => {
                        (TRANSCRIBE_PARSE_FAILED, NO_TRANSCRIPT.to_string())
                    }
                    other => (TRANSCRIBE_FAILED, other.user_message()),
                };
                self.view.send_modify(|v| {
                    v.transcript = transcript.to_string();
                    v.answer = message;
                });
                return Err(e);
            }
        };

        // Shown while the answer stream is still connecting
        self.view.send_modify(|v| v.transcript = transcript.clone());

        match self.stream_answer(&transcript).await {
            Ok(answer) => {
                self.view.send_modify(|v| v.answer = answer);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Answer stream failed: {}", e);
                let message = e.user_message();
                self.view.send_modify(|v| v.answer = message);
                Err(e)
            }
        }
    }

    /// Stream an answer into the view. Returns the full text on `Done`.
    async fn stream_answer(&self, question: &str) -> Result<String, ClientError> {
        self.view.send_modify(|v| {
            v.waiting_for_first_chunk = true;
            v.currently_streaming = true;
            v.simple_answer_shown = false;
            v.answer = RECEIVING.to_string();
        });

        let result = self.read_answer_stream(question).await;

        // Cleared before the caller writes the final answer or error
        self.view.send_modify(|v| {
            v.waiting_for_first_chunk = false;
            v.currently_streaming = false;
        });
        result
    }

    async fn read_answer_stream(&self, question: &str) -> Result<String, ClientError> {
        let mut stream = self.api.ask_stream(question).await?;
        self.active_stream.set(Some(stream.canceller()));
        let progress = stream.subscribe();

        let mut result = Ok(String::new());
        while let Some(event) = stream.next_event().await {
            match event {
                AnswerStreamEvent::Chunk(_) => {
                    let text = stream.aggregate().to_string();
                    let waiting = *progress.borrow() == StreamProgress::Connecting;
                    self.view.send_modify(|v| {
                        v.waiting_for_first_chunk = waiting;
                        v.answer = text;
                    });
                }
                AnswerStreamEvent::Done => {
                    result = Ok(stream.aggregate().to_string());
                }
                AnswerStreamEvent::Error(msg) => {
                    result = Err(ClientError::StreamProtocol(msg));
                }
            }
        }

        self.active_stream.set(None);
        result
    }
}
