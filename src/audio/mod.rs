pub mod capture;
pub mod format;
pub mod sink;
pub mod wav_sink;

pub use capture::{CpalInput, InputDevice, InputStream};
pub use format::AudioFormat;
pub use sink::AudioSink;
pub use wav_sink::WavSink;
