use crate::error::CaptureError;
use async_trait::async_trait;

/// Trait for streaming audio encoding
///
/// Implementations write samples as they arrive rather than buffering the whole
/// recording. Chunks must be written in the order they are passed in.
#[async_trait]
pub trait AudioSink: Send {
    /// Write audio samples (streaming, called repeatedly during recording)
    /// The Vec is moved to avoid copying
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<(), CaptureError>;

    /// Finalize and close the sink. Reports the first write failure, if any.
    async fn finalize(&mut self) -> Result<(), CaptureError>;
}
