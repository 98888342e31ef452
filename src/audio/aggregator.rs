//! Main-context batching, downsampling and pacing of captured audio.

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use super::pcm;
use crate::protocol::{self, ClientMessage};

/// Where outbound packets go. Implemented by the transport client.
pub trait MessageSink {
    fn is_open(&self) -> bool;
    fn send(&self, message: &ClientMessage);
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Render quanta per outbound packet.
    pub batch_quanta: usize,
    /// Rate on the wire, independent of the capture rate.
    pub transmit_rate: u32,
    /// Pause between packets.
    pub send_pace: Duration,
    /// FIFO bound, in batches, while open but not draining.
    pub max_pending_batches: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            batch_quanta: 6,
            transmit_rate: 16000,
            send_pace: Duration::from_millis(10),
            max_pending_batches: 50,
        }
    }
}

pub struct MicAggregator {
    fifo: VecDeque<Vec<f32>>,
    sending: bool,
    mic_rate: u32,
    settings: AggregatorSettings,
    dropped: u64,
}

impl MicAggregator {
    pub fn new(mic_rate: u32, settings: AggregatorSettings) -> Self {
        Self {
            fifo: VecDeque::new(),
            sending: false,
            mic_rate,
            settings,
            dropped: 0,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn pending_frames(&self) -> usize {
        self.fifo.len()
    }

    /// Frames discarded by the overflow bound.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn max_pending_frames(&self) -> usize {
        self.settings.batch_quanta.max(1) * self.settings.max_pending_batches.max(1)
    }

    /// Accept one captured frame. Returns `true` when a send loop must be
    /// started for it.
    pub fn on_frame<S: MessageSink + ?Sized>(&mut self, frame: Vec<f32>, link: &S) -> bool {
        // 断开期间不缓存，避免重连后回放过期音频
        if !link.is_open() {
            return false;
        }

        self.fifo.push_back(frame);
        if self.fifo.len() > self.max_pending_frames() {
            self.fifo.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                log::warn!(
                    "Mic uplink stalled, dropped {} frames (pending={})",
                    self.dropped,
                    self.fifo.len()
                );
            }
        }

        if self.sending {
            false
        } else {
            self.sending = true;
            true
        }
    }

    /// One iteration of the send loop, run after the pacing pause. Returns
    /// `true` if the loop goes on for another pause.
    ///
    /// The loop only ends on an iteration that finds the FIFO empty, so
    /// frames captured during the pause join the next batch instead of
    /// restarting the loop.
    pub fn send_batch<S: MessageSink + ?Sized>(&mut self, link: &S) -> bool {
        if !link.is_open() {
            // Disconnection abandons whatever was still pending.
            self.fifo.clear();
            self.sending = false;
            return false;
        }
        if self.fifo.is_empty() {
            self.sending = false;
            return false;
        }

        let take = self.settings.batch_quanta.max(1).min(self.fifo.len());
        let samples: Vec<f32> = self.fifo.drain(..take).flatten().collect();
        link.send(&self.encode(&samples));
        true
    }

    /// A paced send may run: a full batch is waiting, the FIFO has drained
    /// (the loop can end), or the link is gone.
    fn batch_due<S: MessageSink + ?Sized>(&self, link: &S) -> bool {
        self.fifo.is_empty()
            || self.fifo.len() >= self.settings.batch_quanta.max(1)
            || !link.is_open()
    }

    fn encode(&self, samples: &[f32]) -> ClientMessage {
        let resampled = pcm::resample_linear(samples, self.mic_rate, self.settings.transmit_rate);
        let bytes = pcm::pcm16_to_le_bytes(&pcm::float_to_pcm16(&resampled));
        ClientMessage::Audio {
            data: BASE64.encode(bytes),
            mime_type: protocol::pcm_mime_type(self.settings.transmit_rate),
        }
    }

    /// Drive the aggregator from the capture channel until it closes.
    ///
    /// Frames keep arriving while the loop waits out the pacing pause, so the
    /// capture side is never held up by network pacing. Once the pause is
    /// over, a send waits for a full batch.
    pub async fn run<S: MessageSink + ?Sized>(mut self, mut frames: mpsc::Receiver<Vec<f32>>, link: &S) {
        let mut next_send = Instant::now();
        loop {
            let due = self.sending && self.batch_due(link);
            tokio::select! {
                frame = frames.recv() => {
                    match frame {
                        Some(frame) => {
                            if self.on_frame(frame, link) {
                                next_send = Instant::now();
                            }
                        }
                        None => break,
                    }
                }
                _ = time::sleep_until(next_send), if due => {
                    if self.send_batch(link) {
                        next_send = Instant::now() + self.settings.send_pace;
                    }
                }
            }
        }
        // 采集结束时把剩余的帧发出去
        while self.sending && self.send_batch(link) {}
        log::debug!("Mic aggregator stopped, dropped {} frames", self.dropped);
    }
}
