//! audio - Real-time capture, playback and PCM framing
//!
//! Two dedicated OS threads run the capture and playback processors once per
//! render quantum. The main context batches captured frames for the uplink
//! and feeds decoded downlink audio to the playback queue.

pub mod aggregator;
mod alsa_device;
pub mod capture;
pub mod device;
mod engine;
pub mod pcm;
pub mod playback;

pub use aggregator::{AggregatorSettings, MessageSink, MicAggregator};
pub use alsa_device::AlsaDevices;
pub use capture::CaptureProcessor;
pub use device::{AudioDevices, InputDevice, OutputDevice};
pub use engine::{AudioEngine, AudioSettings};
pub use playback::{
    PlaybackCommand, PlaybackProcessor, PlaybackReceiver, PlaybackSender, PlaybackState, playback_channel,
};
