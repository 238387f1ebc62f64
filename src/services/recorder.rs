use crate::audio::{AudioFormat, AudioSink, InputDevice, InputStream, WavSink};
use crate::error::CaptureError;
use crate::messages::{CaptureState, RecorderCommand, RecordingSession};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot, watch};

/// Coordinates audio capture and encoding
///
/// This service:
/// - Owns the single active recording and its state machine
/// - Receives audio chunks via channel and streams them to the WAV sink
/// - Handles start/stop commands
///
/// Note: the open input stream is !Send, so this service must be spawned
/// on a LocalSet using tokio::task::spawn_local.
pub struct Recorder {
    format: AudioFormat,
    recordings_dir: PathBuf,
    device: Box<dyn InputDevice>,
    cmd_rx: mpsc::Receiver<RecorderCommand>,
    state_tx: watch::Sender<CaptureState>,
    active: Option<ActiveRecording>,
    next_id: u64,
}

struct ActiveRecording {
    session: RecordingSession,
    stream: Box<dyn InputStream>,
    sink: Box<dyn AudioSink>,
    audio_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    write_error: Option<CaptureError>,
}

impl ActiveRecording {
    fn write(&mut self, chunk: Vec<f32>) {
        if self.write_error.is_some() {
            return;
        }
        if let Err(e) = self.sink.write_chunk(chunk) {
            tracing::error!("Failed to write audio chunk: {}", e);
            self.write_error = Some(e);
        }
    }
}

impl Recorder {
    pub fn new(
        format: AudioFormat,
        recordings_dir: PathBuf,
        device: Box<dyn InputDevice>,
        cmd_rx: mpsc::Receiver<RecorderCommand>,
        state_tx: watch::Sender<CaptureState>,
    ) -> Self {
        Self {
            format,
            recordings_dir,
            device,
            cmd_rx,
            state_tx,
            active: None,
            next_id: 1,
        }
    }

    /// Create a recorder on the current LocalSet and return its handle.
    pub fn spawn(
        format: AudioFormat,
        recordings_dir: PathBuf,
        device: Box<dyn InputDevice>,
    ) -> RecorderHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);
        let recorder = Self::new(format, recordings_dir, device, cmd_rx, state_tx);
        tokio::task::spawn_local(recorder.run());
        RecorderHandle::new(cmd_tx, state_rx)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                // Receive and write audio chunks (only while recording)
                Some(chunk) = next_chunk(&mut self.active) => {
                    if let Some(active) = self.active.as_mut() {
                        active.write(chunk);
                    }
                }
            }
        }

        if self.active.is_some() {
            tracing::debug!("Recorder handle dropped mid-recording, stopping");
            let _ = self.stop().await;
        }
    }

    async fn handle_command(&mut self, cmd: RecorderCommand) {
        match cmd {
            RecorderCommand::Start(reply) => {
                let result = self.start().await;
                if let Err(e) = &result {
                    tracing::error!("Failed to start recording: {}", e);
                }
                let _ = reply.send(result);
            }
            RecorderCommand::Stop(reply) => {
                let result = self.stop().await;
                if let Err(e) = &result {
                    tracing::error!("Failed to stop recording: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self) -> Result<RecordingSession, CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let result = self.open_recording().await;
        if result.is_err() {
            self.state_tx.send_replace(CaptureState::Idle);
        }
        result
    }

    async fn open_recording(&mut self) -> Result<RecordingSession, CaptureError> {
        let path = self.create_recording_file()?;

        let mut sink = match WavSink::create(&path, self.format) {
            Ok(sink) => sink,
            Err(e) => {
                discard_file(&path).await;
                return Err(e);
            }
        };

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let stream = match self.device.open(self.format, audio_tx) {
            Ok(stream) => stream,
            Err(e) => {
                // Close the writer before the file goes away
                let _ = sink.finalize().await;
                discard_file(&path).await;
                return Err(e);
            }
        };

        let session = RecordingSession {
            id: self.next_id,
            file_path: path,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            state: CaptureState::Recording,
        };
        self.next_id += 1;

        self.active = Some(ActiveRecording {
            session: session.clone(),
            stream,
            sink: Box::new(sink),
            audio_rx,
            write_error: None,
        });
        self.state_tx.send_replace(CaptureState::Recording);

        tracing::info!("Recording {} started: {:?}", session.id, session.file_path);
        Ok(session)
    }

    /// Detach the callback, drain and close the writer, then release the device.
    async fn stop(&mut self) -> Result<RecordingSession, CaptureError> {
        let mut active = self.active.take().ok_or(CaptureError::NotRecording)?;
        self.state_tx.send_replace(CaptureState::Stopped);

        active.stream.detach().await;

        while let Ok(chunk) = active.audio_rx.try_recv() {
            active.write(chunk);
        }

        let finalize_result = active.sink.finalize().await;

        let ActiveRecording {
            mut session,
            stream,
            write_error,
            ..
        } = active;
        drop(stream);

        let result = match write_error {
            Some(e) => Err(e),
            None => finalize_result,
        };

        match result {
            Ok(()) => {
                session.state = CaptureState::Ready;
                self.state_tx.send_replace(CaptureState::Ready);
                tracing::info!("Recording {} stopped", session.id);
                Ok(session)
            }
            Err(e) => {
                self.state_tx.send_replace(CaptureState::Idle);
                Err(e)
            }
        }
    }

    fn create_recording_file(&self) -> Result<PathBuf, CaptureError> {
        std::fs::create_dir_all(&self.recordings_dir).map_err(|e| {
            CaptureError::Io(format!(
                "failed to create {}: {}",
                self.recordings_dir.display(),
                e
            ))
        })?;

        let file = tempfile::Builder::new()
            .prefix("recording-")
            .suffix(".wav")
            .tempfile_in(&self.recordings_dir)
            .map_err(|e| CaptureError::Io(format!("failed to create recording file: {}", e)))?;

        // Recordings outlive the recorder; nothing deletes them automatically.
        let (_file, path) = file
            .keep()
            .map_err(|e| CaptureError::Io(format!("failed to keep recording file: {}", e)))?;
        Ok(path)
    }
}

async fn next_chunk(active: &mut Option<ActiveRecording>) -> Option<Vec<f32>> {
    match active {
        Some(active) => active.audio_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn discard_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!("Failed to remove {:?}: {}", path, e);
    }
}

/// Handle for communicating with the Recorder
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
    state: watch::Receiver<CaptureState>,
}

impl RecorderHandle {
    pub fn new(tx: mpsc::Sender<RecorderCommand>, state: watch::Receiver<CaptureState>) -> Self {
        Self { tx, state }
    }

    pub async fn start(&self) -> Result<RecordingSession, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Start(reply))
            .await
            .map_err(|_| CaptureError::RecorderUnavailable)?;

        rx.await.map_err(|_| CaptureError::RecorderUnavailable)?
    }

    pub async fn stop(&self) -> Result<RecordingSession, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderCommand::Stop(reply))
            .await
            .map_err(|_| CaptureError::RecorderUnavailable)?;

        rx.await.map_err(|_| CaptureError::RecorderUnavailable)?
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::cell::Cell;

    /// Input device that delivers canned buffers instead of touching hardware.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub buffers: Vec<Vec<f32>>,
        /// Delivered during detach, like a callback firing while stop begins
        pub late_buffer: Option<Vec<f32>>,
        pub failures: Cell<usize>,
    }

    struct FakeStream {
        tx: Option<mpsc::UnboundedSender<Vec<f32>>>,
        late_buffer: Option<Vec<f32>>,
    }

    impl InputDevice for FakeDevice {
        fn open(
            &self,
            _format: AudioFormat,
            chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
        ) -> Result<Box<dyn InputStream>, CaptureError> {
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(CaptureError::NoInputDevice);
            }
            for buffer in &self.buffers {
                chunk_tx.send(buffer.clone()).unwrap();
            }
            Ok(Box::new(FakeStream {
                tx: Some(chunk_tx),
                late_buffer: self.late_buffer.clone(),
            }))
        }
    }

    #[async_trait(?Send)]
    impl InputStream for FakeStream {
        async fn detach(&mut self) {
            if let (Some(tx), Some(buffer)) = (self.tx.take(), self.late_buffer.take()) {
                tx.send(buffer).unwrap();
            }
        }
    }

    fn wav_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "wav"))
            .collect()
    }

    #[tokio::test]
    async fn start_then_stop_without_buffers_is_ready() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let recorder = Recorder::spawn(
                    AudioFormat::default(),
                    dir.path().to_path_buf(),
                    Box::new(FakeDevice::default()),
                );

                let started = recorder.start().await.unwrap();
                assert_eq!(started.state, CaptureState::Recording);
                assert_eq!(recorder.state(), CaptureState::Recording);

                let session = recorder.stop().await.unwrap();
                assert_eq!(session.state, CaptureState::Ready);
                assert_eq!(session.id, started.id);
                assert_eq!(session.sample_rate, 44100);
                assert_eq!(session.channels, 1);
                assert_eq!(recorder.state(), CaptureState::Ready);

                let reader = hound::WavReader::open(&session.file_path).unwrap();
                assert_eq!(reader.len(), 0);
                assert_eq!(reader.spec().sample_rate, 44100);
            })
            .await;
    }

    #[tokio::test]
    async fn buffers_are_written_in_arrival_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let device = FakeDevice {
                    buffers: vec![vec![0.0, 0.5], vec![-0.5]],
                    late_buffer: Some(vec![1.0]),
                    ..Default::default()
                };
                let recorder =
                    Recorder::spawn(AudioFormat::default(), dir.path().to_path_buf(), Box::new(device));

                recorder.start().await.unwrap();
                let session = recorder.stop().await.unwrap();

                let mut reader = hound::WavReader::open(&session.file_path).unwrap();
                let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
                let half = (0.5 * i16::MAX as f32) as i16;
                assert_eq!(samples, vec![0, half, -half, i16::MAX]);
            })
            .await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let recorder = Recorder::spawn(
                    AudioFormat::default(),
                    dir.path().to_path_buf(),
                    Box::new(FakeDevice::default()),
                );

                recorder.start().await.unwrap();
                assert!(matches!(
                    recorder.start().await,
                    Err(CaptureError::AlreadyRecording)
                ));
                assert_eq!(recorder.state(), CaptureState::Recording);
                assert!(recorder.stop().await.is_ok());
                assert_eq!(wav_files(dir.path()).len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn file_failure_after_a_recording_returns_to_idle() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let recordings = dir.path().join("recordings");
                let recorder = Recorder::spawn(
                    AudioFormat::default(),
                    recordings.clone(),
                    Box::new(FakeDevice::default()),
                );

                recorder.start().await.unwrap();
                recorder.stop().await.unwrap();
                assert_eq!(recorder.state(), CaptureState::Ready);

                // A plain file where the directory should be
                std::fs::remove_dir_all(&recordings).unwrap();
                std::fs::write(&recordings, b"not a directory").unwrap();

                assert!(matches!(recorder.start().await, Err(CaptureError::Io(_))));
                assert_eq!(recorder.state(), CaptureState::Idle);
            })
            .await;
    }

    #[tokio::test]
    async fn device_failure_returns_to_idle_and_allows_retry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let device = FakeDevice {
                    failures: Cell::new(1),
                    ..Default::default()
                };
                let recorder =
                    Recorder::spawn(AudioFormat::default(), dir.path().to_path_buf(), Box::new(device));

                assert!(matches!(
                    recorder.start().await,
                    Err(CaptureError::NoInputDevice)
                ));
                assert_eq!(recorder.state(), CaptureState::Idle);
                assert!(wav_files(dir.path()).is_empty());

                recorder.start().await.unwrap();
                let session = recorder.stop().await.unwrap();
                assert!(session.file_path.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let recorder = Recorder::spawn(
                    AudioFormat::default(),
                    dir.path().to_path_buf(),
                    Box::new(FakeDevice::default()),
                );

                assert!(matches!(recorder.stop().await, Err(CaptureError::NotRecording)));
                assert_eq!(recorder.state(), CaptureState::Idle);
            })
            .await;
    }

    #[tokio::test]
    async fn each_recording_gets_its_own_file() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let dir = tempfile::tempdir().unwrap();
                let recorder = Recorder::spawn(
                    AudioFormat::default(),
                    dir.path().join("nested"),
                    Box::new(FakeDevice::default()),
                );

                recorder.start().await.unwrap();
                let first = recorder.stop().await.unwrap();
                recorder.start().await.unwrap();
                let second = recorder.stop().await.unwrap();

                assert_ne!(first.id, second.id);
                assert_ne!(first.file_path, second.file_path);
                assert!(first.file_path.exists());
                assert!(second.file_path.exists());
            })
            .await;
    }
}
