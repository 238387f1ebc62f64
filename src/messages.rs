use crate::error::CaptureError;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Commands for the Recorder service
pub enum RecorderCommand {
    Start(oneshot::Sender<Result<RecordingSession, CaptureError>>),
    Stop(oneshot::Sender<Result<RecordingSession, CaptureError>>),
}

/// Capture lifecycle (observable via watch channel)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    Recording,
    Stopped,
    Ready,
}

/// One microphone recording and the WAV file it writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingSession {
    pub id: u64,
    pub file_path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub state: CaptureState,
}

/// Everything the shell renders (observable via watch channel)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewState {
    pub prompt: String,
    pub transcript: String,
    pub answer: String,
    /// Status line for the voice panel
    pub notice: String,
    pub busy: bool,
    /// A stream is open but no chunk has arrived yet
    pub waiting_for_first_chunk: bool,
    pub currently_streaming: bool,
    pub simple_answer_shown: bool,
    pub capture: CaptureState,
    pub recording: Option<PathBuf>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            transcript: String::new(),
            answer: String::new(),
            notice: String::new(),
            busy: false,
            waiting_for_first_chunk: false,
            currently_streaming: false,
            simple_answer_shown: true,
            capture: CaptureState::Idle,
            recording: None,
        }
    }
}
