//! Real-time voice client for a streaming conversational-agent backend.
//!
//! Microphone audio is captured on a dedicated thread, batched and
//! resampled to 16 kHz PCM16, and streamed as base64 JSON frames over one
//! WebSocket. Agent audio comes back the same way and is resampled into the
//! output device, with immediate flush on barge-in.

pub mod audio;
pub mod config;
pub mod error;
pub mod health;
pub mod net_link;
pub mod protocol;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use net_link::TransportClient;
pub use session::{SessionEvent, VoiceSession};
