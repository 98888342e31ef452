//! ALSA PCM devices for capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::device::{AudioDevices, InputDevice, OutputDevice};
use super::pcm::{sample_to_float, sample_to_pcm16};
use crate::config::Config;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
}

/// ALSA device names and requested formats.
#[derive(Debug, Clone)]
pub struct AlsaDevices {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    pub playback_device: String,
    /// Requested rates; the hardware may negotiate something else
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
}

impl AlsaDevices {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.clone(),
            playback_device: config.playback_device.clone(),
            capture_sample_rate: config.capture_sample_rate,
            playback_sample_rate: config.playback_sample_rate,
            playback_channels: config.playback_channels,
        }
    }
}

impl AudioDevices for AlsaDevices {
    fn open_input(&self, quantum_frames: usize) -> Result<Box<dyn InputDevice>> {
        let (pcm, params) = open_pcm(
            &self.capture_device,
            Direction::Capture,
            self.capture_sample_rate,
            1,
            Some(quantum_frames),
            "Capture",
        )?;
        let scratch = vec![0i16; quantum_frames * params.channels as usize];
        Ok(Box::new(AlsaInput { pcm, params, scratch }))
    }

    fn open_output(&self, quantum_frames: usize) -> Result<Box<dyn OutputDevice>> {
        let (pcm, params) = open_pcm(
            &self.playback_device,
            Direction::Playback,
            self.playback_sample_rate,
            self.playback_channels,
            Some(quantum_frames),
            "Playback",
        )?;
        let scratch = vec![0i16; quantum_frames * params.channels as usize];
        Ok(Box::new(AlsaOutput { pcm, params, scratch }))
    }
}

struct AlsaInput {
    pcm: PCM,
    params: AlsaParams,
    scratch: Vec<i16>,
}

impl InputDevice for AlsaInput {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        let channels = self.params.channels.max(1) as usize;
        let wanted = buf.len().min(self.scratch.len() / channels);
        let io = self.pcm.io_i16()?;
        let frames = io.readi(&mut self.scratch[..wanted * channels])?;
        // Mono: keep the first channel of whatever the device delivered
        for (i, out) in buf.iter_mut().take(frames).enumerate() {
            *out = sample_to_float(self.scratch[i * channels]);
        }
        Ok(frames)
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare()?;
        Ok(())
    }
}

struct AlsaOutput {
    pcm: PCM,
    params: AlsaParams,
    scratch: Vec<i16>,
}

impl OutputDevice for AlsaOutput {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> usize {
        self.params.channels.max(1) as usize
    }

    fn write(&mut self, buf: &[f32]) -> Result<()> {
        let channels = self.channels();
        let len = buf.len().min(self.scratch.len());
        for (dst, &src) in self.scratch[..len].iter_mut().zip(buf) {
            *dst = sample_to_pcm16(src);
        }

        // Short writes are retried until the whole quantum is accepted
        let io = self.pcm.io_i16()?;
        let total_frames = len / channels;
        let mut frames_written = 0;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            frames_written += io.writei(&self.scratch[offset..len])?;
        }
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare()?;
        Ok(())
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    // Configure hardware parameters
    {
        let hwp =
            HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}
