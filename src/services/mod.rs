pub mod orchestrator;
pub mod recorder;

pub use orchestrator::{CancelHandle, DeliveryMode, VoiceMode, VoiceOrchestrator, VoiceSettings};
pub use recorder::{Recorder, RecorderHandle};
