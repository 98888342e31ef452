//! Audio-thread side of microphone capture.

use tokio::sync::mpsc;

/// Copies each captured render quantum and hands it to the main context.
///
/// Runs on the capture thread. `process` never blocks: when the main context
/// falls behind and the channel is full, the frame is counted as dropped.
pub struct CaptureProcessor {
    tx: mpsc::Sender<Vec<f32>>,
    dropped: u64,
}

impl CaptureProcessor {
    pub fn new(tx: mpsc::Sender<Vec<f32>>) -> Self {
        Self { tx, dropped: 0 }
    }

    /// Process one quantum of mono input. Always returns `true`; the owner
    /// decides when capture stops.
    pub fn process(&mut self, input: Option<&[f32]>) -> bool {
        let Some(frame) = input.filter(|f| !f.is_empty()) else {
            return true;
        };
        // The device buffer is reused every quantum, so the frame is copied.
        if self.tx.try_send(frame.to_vec()).is_err() {
            self.dropped += 1;
        }
        true
    }

    /// Frames discarded because the main context was not keeping up.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_or_empty_input_is_noop() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut processor = CaptureProcessor::new(tx);
        assert!(processor.process(None));
        assert!(processor.process(Some(&[])));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_frame_is_copied_and_forwarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut processor = CaptureProcessor::new(tx);
        let mut buf = vec![0.25f32, -0.5, 0.75];
        assert!(processor.process(Some(&buf)));
        buf.fill(0.0);
        assert_eq!(rx.try_recv().unwrap(), vec![0.25, -0.5, 0.75]);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut processor = CaptureProcessor::new(tx);
        assert!(processor.process(Some(&[0.1])));
        assert!(processor.process(Some(&[0.2])));
        assert_eq!(processor.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), vec![0.1]);
    }

    #[test]
    fn test_closed_receiver_keeps_running() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut processor = CaptureProcessor::new(tx);
        assert!(processor.process(Some(&[0.1])));
        assert_eq!(processor.dropped(), 1);
    }
}
