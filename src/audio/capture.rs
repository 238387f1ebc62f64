use super::format::AudioFormat;
use crate::error::CaptureError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::{HeapCons, HeapRb, traits::*};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Source of microphone buffers.
///
/// `open` starts delivering buffers on `chunk_tx` in capture order. The returned
/// stream keeps the device open until it is dropped.
pub trait InputDevice {
    fn open(
        &self,
        format: AudioFormat,
        chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// An open capture stream. Dropping it releases the device.
#[async_trait(?Send)]
pub trait InputStream {
    /// Stop the device callback. When this returns, every buffer the callback
    /// produced has been sent on the chunk channel.
    async fn detach(&mut self);
}

/// Default system microphone via cpal
pub struct CpalInput;

impl InputDevice for CpalInput {
    fn open(
        &self,
        format: AudioFormat,
        chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        let ring = HeapRb::<f32>::new(format.samples_for_duration(60.0));
        let (mut producer, consumer) = ring.split();

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let notify = Arc::new(Notify::new());
        let notify_callback = notify.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let pushed = producer.push_slice(data);
                    if pushed < data.len() {
                        tracing::warn!("Capture ring buffer full, dropped {} samples", data.len() - pushed);
                    }
                    notify_callback.notify_one();
                },
                move |err| {
                    tracing::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::Device(format!("failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| CaptureError::Device(format!("failed to start input stream: {}", e)))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let chunk_size = format.samples_for_duration(0.5);
        let bridge = tokio::task::spawn_local(bridge_task(
            consumer,
            chunk_tx,
            chunk_size,
            notify,
            shutdown_rx,
        ));

        tracing::info!("Audio capture started");
        Ok(Box::new(CpalStream {
            stream,
            shutdown: Some(shutdown_tx),
            bridge: Some(bridge),
        }))
    }
}

struct CpalStream {
    stream: cpal::Stream,
    shutdown: Option<oneshot::Sender<()>>,
    bridge: Option<JoinHandle<()>>,
}

#[async_trait(?Send)]
impl InputStream for CpalStream {
    async fn detach(&mut self) {
        if let Err(e) = self.stream.pause() {
            tracing::warn!("Failed to pause input stream: {}", e);
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.await {
                tracing::warn!("Capture bridge task failed: {}", e);
            }
        }
    }
}

/// Moves samples from the realtime ring buffer onto the chunk channel.
///
/// Forwards in half-second chunks while recording and flushes the remainder on
/// shutdown so the tail of the recording is not lost.
async fn bridge_task(
    mut consumer: HeapCons<f32>,
    tx: mpsc::UnboundedSender<Vec<f32>>,
    chunk_size: usize,
    notify: Arc<Notify>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = notify.notified() => {
                if !forward(&mut consumer, &tx, chunk_size) {
                    break;
                }
            }
            _ = &mut shutdown => {
                forward(&mut consumer, &tx, 1);
                break;
            }
        }
    }
}

/// Returns false once the receiving side is gone.
fn forward(consumer: &mut HeapCons<f32>, tx: &mpsc::UnboundedSender<Vec<f32>>, min_len: usize) -> bool {
    let available = consumer.occupied_len();
    if available == 0 || available < min_len {
        return true;
    }

    let mut chunk = vec![0.0f32; available];
    let n = consumer.pop_slice(&mut chunk);
    chunk.truncate(n);
    tx.send(chunk).is_ok()
}
