use super::format::AudioFormat;
use super::sink::AudioSink;
use crate::error::CaptureError;
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

enum WavCommand {
    WriteChunk(Vec<f32>),
    Finalize {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
}

/// WAV encoder using a dedicated blocking thread for I/O
///
/// Audio chunks are sent to the thread via a channel and written sequentially,
/// so the recorder never blocks on disk. A failed write stops further writes and
/// is reported when the sink is finalized.
pub struct WavSink {
    tx: mpsc::UnboundedSender<WavCommand>,
}

impl WavSink {
    pub fn create(path: &Path, format: AudioFormat) -> Result<Self, CaptureError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec)
            .map_err(|e| CaptureError::Write(format!("failed to create WAV writer: {}", e)))?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let mut write_error: Option<String> = None;

            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    WavCommand::WriteChunk(samples) => {
                        if write_error.is_some() {
                            continue;
                        }
                        for sample in samples {
                            // Convert f32 (-1.0 to 1.0) to i16
                            let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            if let Err(e) = writer.write_sample(amplitude) {
                                tracing::error!("Failed to write sample: {}", e);
                                write_error = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    WavCommand::Finalize { reply } => {
                        let result = match write_error.take() {
                            Some(e) => Err(CaptureError::Write(e)),
                            None => writer.finalize().map_err(|e| {
                                CaptureError::Write(format!("failed to finalize WAV: {}", e))
                            }),
                        };
                        let _ = reply.send(result);
                        return;
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

#[async_trait]
impl AudioSink for WavSink {
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<(), CaptureError> {
        self.tx
            .send(WavCommand::WriteChunk(samples))
            .map_err(|_| CaptureError::Write("WAV writer thread has exited".to_string()))
    }

    async fn finalize(&mut self) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WavCommand::Finalize { reply })
            .map_err(|_| CaptureError::Write("WAV writer thread has exited".to_string()))?;

        rx.await
            .map_err(|_| CaptureError::Write("WAV writer dropped the finalize reply".to_string()))?
    }
}
