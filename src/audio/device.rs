//! Device seams between the real-time loops and the host audio API.
//!
//! Devices are opened on the thread that uses them, so implementations do
//! not need to be `Send`; only the factory crosses threads.

use anyhow::Result;

/// Mono capture source, paced by the hardware.
pub trait InputDevice {
    /// Negotiated sample rate.
    fn sample_rate(&self) -> u32;
    /// Block until up to `buf.len()` mono frames are available. Returns the
    /// number of frames written.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
    /// Re-arm the device after a read error (e.g. overrun).
    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Interleaved playback sink, paced by the hardware.
pub trait OutputDevice {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;
    /// Write interleaved frames, blocking until the device accepted them.
    fn write(&mut self, buf: &[f32]) -> Result<()>;
    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens the input and output devices for one session.
pub trait AudioDevices: Send + Sync {
    fn open_input(&self, quantum_frames: usize) -> Result<Box<dyn InputDevice>>;
    fn open_output(&self, quantum_frames: usize) -> Result<Box<dyn OutputDevice>>;
}
