//! Audio-thread playback queue with continuous rate conversion.
//!
//! The main context pushes frames through a [`PlaybackSender`]; the playback
//! thread applies them between quanta through its [`PlaybackReceiver`] and
//! then calls [`PlaybackProcessor::render`]. All work on the audio side is
//! synchronous and bounded by the quantum size.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::pcm;

/// Control messages from the main context.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    /// Append one decoded frame, declared at `sample_rate`.
    Push { frame: Vec<f32>, sample_rate: u32 },
    /// Barge-in: drop everything queued and reset the resampler.
    Clear,
}

struct QueuedFrame {
    generation: u64,
    frame: Vec<f32>,
    sample_rate: u32,
}

/// Bounded frame lane plus a flush counter shared with the playback thread.
pub fn playback_channel(capacity: usize) -> (PlaybackSender, PlaybackReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let generation = Arc::new(AtomicU64::new(0));
    (
        PlaybackSender {
            tx,
            generation: generation.clone(),
        },
        PlaybackReceiver {
            rx,
            generation,
            applied: 0,
        },
    )
}

/// Main-context half of the playback mailbox.
///
/// Frames go through a bounded channel and may be refused when it is full.
/// A flush only bumps the generation counter, so it cannot be lost; frames
/// tagged with an older generation are discarded when they arrive.
#[derive(Clone)]
pub struct PlaybackSender {
    tx: mpsc::Sender<QueuedFrame>,
    generation: Arc<AtomicU64>,
}

impl PlaybackSender {
    /// Queue one frame declared at `sample_rate`. Returns `false` if the
    /// frame was refused (queue full or playback gone).
    pub fn push(&self, frame: Vec<f32>, sample_rate: u32) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        self.tx
            .try_send(QueuedFrame {
                generation,
                frame,
                sample_rate,
            })
            .is_ok()
    }

    /// Push PCM16LE wire bytes. Decoding happens on the caller's thread so
    /// the audio thread only appends.
    pub fn push_pcm16(&self, bytes: &[u8], sample_rate: u32) -> bool {
        let frame = pcm::pcm16_to_float(&pcm::le_bytes_to_pcm16(bytes));
        self.push(frame, sample_rate)
    }

    /// Barge-in: everything pushed before this call is dropped, effective
    /// on the next quantum.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Playback-thread half of the mailbox.
pub struct PlaybackReceiver {
    rx: mpsc::Receiver<QueuedFrame>,
    generation: Arc<AtomicU64>,
    applied: u64,
}

impl PlaybackReceiver {
    /// Apply pending flushes and frames before rendering the next quantum.
    /// Never blocks. Returns `false` once every sender is gone.
    pub fn apply_pending(&mut self, processor: &mut PlaybackProcessor) -> bool {
        self.catch_up(self.generation.load(Ordering::Acquire), processor);
        loop {
            match self.rx.try_recv() {
                Ok(queued) => {
                    // 打断之前排队的音频直接丢弃
                    if queued.generation < self.applied {
                        continue;
                    }
                    self.catch_up(queued.generation, processor);
                    processor.handle(PlaybackCommand::Push {
                        frame: queued.frame,
                        sample_rate: queued.sample_rate,
                    });
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn catch_up(&mut self, generation: u64, processor: &mut PlaybackProcessor) {
        if generation > self.applied {
            processor.clear();
            self.applied = generation;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Empty,
    Draining,
}

pub struct PlaybackProcessor {
    queue: VecDeque<Vec<f32>>,
    /// Offset of the next sample inside the head frame.
    offset: usize,
    input_rate: u32,
    phase: f64,
    last: f32,
}

impl PlaybackProcessor {
    pub fn new(initial_rate: u32) -> Self {
        Self {
            queue: VecDeque::with_capacity(64),
            offset: 0,
            input_rate: initial_rate,
            phase: 0.0,
            last: 0.0,
        }
    }

    pub fn handle(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::Push { frame, sample_rate } => {
                // The rate is a single value shared by everything still queued.
                if sample_rate > 0 {
                    self.input_rate = sample_rate;
                }
                self.queue.push_back(frame);
            }
            PlaybackCommand::Clear => self.clear(),
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.offset = 0;
        self.phase = 0.0;
        self.last = 0.0;
    }

    pub fn state(&self) -> PlaybackState {
        if self.queued_samples() == 0 {
            PlaybackState::Empty
        } else {
            PlaybackState::Draining
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Samples not yet consumed by `next_sample`.
    pub fn queued_samples(&self) -> usize {
        let total: usize = self.queue.iter().map(Vec::len).sum();
        total.saturating_sub(self.offset)
    }

    /// Fill one interleaved quantum. `output_rate` is the hardware rate for
    /// this callback; the mono signal is copied to every channel.
    pub fn render(&mut self, out: &mut [f32], channels: usize, output_rate: u32) {
        let channels = channels.max(1);
        if output_rate == 0 {
            out.fill(0.0);
            return;
        }
        let step = f64::from(self.input_rate) / f64::from(output_rate);

        for frame in out.chunks_mut(channels) {
            self.phase += step;
            while self.phase >= 1.0 {
                self.phase -= 1.0;
                self.last = self.next_sample();
            }
            let next = self.peek();
            let value = self.last + (next - self.last) * self.phase as f32;
            frame.fill(value);
        }
    }

    /// Pop the next raw sample, rotating to the next frame when the head is
    /// exhausted. Silence when nothing is queued.
    fn next_sample(&mut self) -> f32 {
        while let Some(head) = self.queue.front() {
            if self.offset < head.len() {
                let sample = head[self.offset];
                self.offset += 1;
                return sample;
            }
            self.queue.pop_front();
            self.offset = 0;
        }
        0.0
    }

    fn peek(&self) -> f32 {
        let mut offset = self.offset;
        for frame in &self.queue {
            if offset < frame.len() {
                return frame[offset];
            }
            offset = 0;
        }
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(p: &mut PlaybackProcessor, frame: &[f32], rate: u32) {
        p.handle(PlaybackCommand::Push {
            frame: frame.to_vec(),
            sample_rate: rate,
        });
    }

    #[test]
    fn test_empty_queue_renders_silence() {
        let mut p = PlaybackProcessor::new(24000);
        let mut out = vec![1.0f32; 256];
        p.render(&mut out, 2, 48000);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(p.state(), PlaybackState::Empty);
    }

    #[test]
    fn test_silent_frame_at_matching_rate() {
        let mut p = PlaybackProcessor::new(24000);
        push(&mut p, &[0.0; 480], 48000);
        let mut out = vec![1.0f32; 128];
        p.render(&mut out, 1, 48000);
        assert_eq!(out.len(), 128);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(p.queued_samples(), 480 - 128);
        assert_eq!(p.state(), PlaybackState::Draining);
    }

    #[test]
    fn test_drains_in_push_order() {
        let mut p = PlaybackProcessor::new(16000);
        push(&mut p, &[0.1, 0.2, 0.3], 16000);
        push(&mut p, &[0.4, 0.5], 16000);
        let mut out = vec![0.0f32; 7];
        p.render(&mut out, 1, 16000);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.0, 0.0]);
        assert_eq!(p.state(), PlaybackState::Empty);
    }

    #[test]
    fn test_mono_is_duplicated_to_every_channel() {
        let mut p = PlaybackProcessor::new(8000);
        push(&mut p, &[0.25, -0.25], 8000);
        let mut out = vec![0.0f32; 4];
        p.render(&mut out, 2, 8000);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_clear_is_immediate() {
        let mut p = PlaybackProcessor::new(16000);
        push(&mut p, &[0.5; 64], 16000);
        let mut out = vec![0.0f32; 16];
        p.render(&mut out, 1, 16000);
        assert!(out.iter().all(|&s| s == 0.5));

        p.handle(PlaybackCommand::Clear);
        assert_eq!(p.state(), PlaybackState::Empty);
        p.render(&mut out, 1, 16000);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_clear_then_push_starts_at_new_frame() {
        let mut p = PlaybackProcessor::new(16000);
        push(&mut p, &[0.9; 32], 16000);
        let mut out = vec![0.0f32; 8];
        p.render(&mut out, 1, 16000);

        p.handle(PlaybackCommand::Clear);
        push(&mut p, &[-0.3, -0.2, -0.1], 16000);
        let mut out = vec![0.0f32; 3];
        p.render(&mut out, 1, 16000);
        assert_eq!(out, vec![-0.3, -0.2, -0.1]);
    }

    #[test]
    fn test_upsampling_interpolates_between_samples() {
        let mut p = PlaybackProcessor::new(24000);
        push(&mut p, &[0.0, 1.0, 1.0], 24000);
        let mut out = vec![0.0f32; 5];
        p.render(&mut out, 1, 48000);
        // One input sample of look-ahead: the ramp 0 -> 1 lands on outputs 1..=3.
        assert_eq!(out, vec![0.0, 0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_downsampling_consumes_faster() {
        let mut p = PlaybackProcessor::new(48000);
        push(&mut p, &(0..8).map(|i| i as f32).collect::<Vec<_>>(), 48000);
        let mut out = vec![0.0f32; 4];
        p.render(&mut out, 1, 24000);
        assert_eq!(out, vec![1.0, 3.0, 5.0, 7.0]);
        assert_eq!(p.state(), PlaybackState::Empty);
    }

    #[test]
    fn test_latest_push_rate_applies_to_queue() {
        let mut p = PlaybackProcessor::new(24000);
        push(&mut p, &[0.0; 10], 24000);
        push(&mut p, &[0.0; 10], 16000);
        assert_eq!(p.input_rate(), 16000);
    }

    #[test]
    fn test_push_pcm16_decodes_on_caller_side() {
        let (tx, mut rx) = playback_channel(4);
        let mut p = PlaybackProcessor::new(16000);
        assert!(tx.push_pcm16(&[0x00, 0x40, 0x00, 0xC0], 24000));
        assert!(rx.apply_pending(&mut p));
        assert_eq!(p.input_rate(), 24000);
        let mut out = vec![0.0f32; 2];
        p.render(&mut out, 1, 24000);
        assert_eq!(out, vec![0.5, -0.5]);
    }

    #[test]
    fn test_clear_is_delivered_when_queue_is_full() {
        let (tx, mut rx) = playback_channel(2);
        let mut p = PlaybackProcessor::new(24000);
        assert!(tx.push(vec![0.8; 16], 24000));
        assert!(tx.push(vec![0.8; 16], 24000));
        assert!(!tx.push(vec![0.8; 16], 24000));

        tx.clear();
        assert!(rx.apply_pending(&mut p));
        assert_eq!(p.state(), PlaybackState::Empty);

        assert!(tx.push(vec![0.3], 24000));
        assert!(rx.apply_pending(&mut p));
        let mut out = vec![0.0f32; 1];
        p.render(&mut out, 1, 24000);
        assert_eq!(out, vec![0.3]);
    }

    #[test]
    fn test_clear_drops_frames_queued_before_it() {
        let (tx, mut rx) = playback_channel(8);
        let mut p = PlaybackProcessor::new(24000);
        assert!(tx.push(vec![0.9; 32], 24000));
        assert!(rx.apply_pending(&mut p));
        let mut out = vec![0.0f32; 8];
        p.render(&mut out, 1, 24000);

        assert!(tx.push(vec![0.1; 4], 24000));
        tx.clear();
        assert!(tx.push(vec![0.2; 3], 24000));
        assert!(rx.apply_pending(&mut p));
        assert_eq!(p.queued_samples(), 3);

        let mut out = vec![0.0f32; 3];
        p.render(&mut out, 1, 24000);
        assert_eq!(out, vec![0.2; 3]);
    }

    #[test]
    fn test_receiver_reports_closed_senders() {
        let (tx, mut rx) = playback_channel(2);
        let mut p = PlaybackProcessor::new(24000);
        assert!(tx.push(vec![0.5], 24000));
        drop(tx);
        assert!(!rx.apply_pending(&mut p));
        assert_eq!(p.queued_samples(), 1);
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut p = PlaybackProcessor::new(8000);
        push(&mut p, &[], 8000);
        push(&mut p, &[0.7], 8000);
        let mut out = vec![0.0f32; 1];
        p.render(&mut out, 1, 8000);
        assert_eq!(out, vec![0.7]);
    }
}
