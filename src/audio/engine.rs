//! The audio engine that owns the capture and playback threads.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks. The threads talk to the main context
//! only through bounded channels, using non-blocking `try_send`/`try_recv`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};

use super::capture::CaptureProcessor;
use super::device::{AudioDevices, InputDevice, OutputDevice};
use super::playback::{PlaybackProcessor, PlaybackReceiver, PlaybackSender, playback_channel};
use crate::error::{Error, Result};

/// Consecutive device errors tolerated before a loop gives up.
const MAX_RECOVERY_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Frames per render quantum
    pub quantum_frames: usize,
    /// Depth of the mic-frame and playback-command channels
    pub channel_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            quantum_frames: 128,
            channel_capacity: 512,
        }
    }
}

/// Running capture and playback threads for one session.
///
/// - Capture thread: device → `CaptureProcessor` → mic frames channel
/// - Playback thread: `PlaybackReceiver` → `PlaybackProcessor` → device
///
/// A thread that gives up on its device reports why on the fault channel.
pub struct AudioEngine {
    running: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    playback_handle: Option<JoinHandle<()>>,
    mic_rate: u32,
    output_rate: u32,
    mic_frames: Option<mpsc::Receiver<Vec<f32>>>,
    faults: Option<mpsc::Receiver<anyhow::Error>>,
    playback_tx: PlaybackSender,
}

impl AudioEngine {
    /// Open both devices on their own threads and start rendering.
    ///
    /// Fails if either device cannot be opened; anything already started is
    /// stopped before returning.
    pub async fn start(devices: Arc<dyn AudioDevices>, settings: &AudioSettings) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let quantum = settings.quantum_frames.max(1);
        let (frame_tx, frame_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (playback_tx, playback_rx) = playback_channel(settings.channel_capacity);
        // 两个线程各自最多上报一次
        let (fault_tx, fault_rx) = mpsc::channel(2);

        let mut engine = Self {
            running: running.clone(),
            capture_handle: None,
            playback_handle: None,
            mic_rate: 0,
            output_rate: 0,
            mic_frames: Some(frame_rx),
            faults: Some(fault_rx),
            playback_tx,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let capture_handle = {
            let running = running.clone();
            let devices = devices.clone();
            let fault_tx = fault_tx.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || {
                    let device = match devices.open_input(quantum) {
                        Ok(device) => device,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(device.sample_rate()));
                    let processor = CaptureProcessor::new(frame_tx);
                    if let Err(e) = capture_loop(device, processor, quantum, &running) {
                        let _ = fault_tx.try_send(e);
                    }
                })
                .map_err(|e| Error::Device(e.into()))?
        };
        engine.capture_handle = Some(capture_handle);
        engine.mic_rate = match wait_ready(ready_rx, "capture").await {
            Ok(rate) => rate,
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let playback_handle = {
            let running = running.clone();
            let spawned = thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || {
                    let device = match devices.open_output(quantum) {
                        Ok(device) => device,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let rate = device.sample_rate();
                    let _ = ready_tx.send(Ok(rate));
                    let processor = PlaybackProcessor::new(rate);
                    if let Err(e) = playback_loop(device, processor, playback_rx, quantum, &running) {
                        let _ = fault_tx.try_send(e);
                    }
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    engine.shutdown().await;
                    return Err(Error::Device(e.into()));
                }
            }
        };
        engine.playback_handle = Some(playback_handle);
        engine.output_rate = match wait_ready(ready_rx, "playback").await {
            Ok(rate) => rate,
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        };

        log::info!(
            "AudioEngine started: mic: {}Hz, output: {}Hz, quantum: {} frames",
            engine.mic_rate,
            engine.output_rate,
            quantum,
        );
        Ok(engine)
    }

    pub fn mic_rate(&self) -> u32 {
        self.mic_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// The captured-frame stream. Can be taken once.
    pub fn take_mic_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.mic_frames.take()
    }

    /// Unrecoverable device errors, one per failed thread. Can be taken once.
    pub fn take_faults(&mut self) -> Option<mpsc::Receiver<anyhow::Error>> {
        self.faults.take()
    }

    pub fn playback_sender(&self) -> PlaybackSender {
        self.playback_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal threads to stop and wait for them to finish. Idempotent.
    ///
    /// Blocks for up to one device period; from async code use `shutdown`.
    pub fn stop(&mut self) {
        join_all(self.signal_stop());
    }

    /// `stop` with the joins moved onto the blocking pool.
    pub async fn shutdown(mut self) {
        let handles = self.signal_stop();
        if handles.is_empty() {
            return;
        }
        if let Err(e) = tokio::task::spawn_blocking(move || join_all(handles)).await {
            log::warn!("Audio thread join failed: {}", e);
        }
    }

    fn signal_stop(&mut self) -> Vec<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        self.mic_frames.take();
        self.capture_handle
            .take()
            .into_iter()
            .chain(self.playback_handle.take())
            .collect()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let handles = self.signal_stop();
        if handles.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            // 在运行时里不阻塞工作线程，线程看到 running=false 后自行退出
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_all(handles));
            }
            Err(_) => join_all(handles),
        }
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            log::error!("Audio thread panicked");
        }
    }
}

async fn wait_ready(
    rx: oneshot::Receiver<anyhow::Result<u32>>,
    what: &str,
) -> Result<u32> {
    match rx.await {
        Ok(Ok(rate)) if rate > 0 => Ok(rate),
        Ok(Ok(_)) => Err(Error::Device(anyhow!("{} device reported a zero sample rate", what))),
        Ok(Err(e)) => Err(Error::Device(e.context(format!("failed to open {} device", what)))),
        Err(_) => Err(Error::Device(anyhow!("{} thread exited before the device was ready", what))),
    }
}

// ======================== Capture thread ========================

/// Runs until `running` clears. Returns `Err` when the device is given up on.
fn capture_loop(
    mut device: Box<dyn InputDevice>,
    mut processor: CaptureProcessor,
    quantum: usize,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut buf = vec![0.0f32; quantum];
    let mut retry_count = 0u32;

    log::info!("Capture started: rate={}, quantum={}", device.sample_rate(), quantum);

    while running.load(Ordering::Relaxed) {
        match device.read(&mut buf) {
            Ok(frames) => {
                retry_count = 0;
                processor.process(Some(&buf[..frames.min(quantum)]));
            }
            Err(e) => {
                log::warn!("Capture device error: {}, recovering...", e);
                retry_count += 1;
                if let Err(e2) = device.recover() {
                    log::error!("Failed to recover capture device: {}", e2);
                    return Err(e2.context("failed to recover capture device"));
                }
                if retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!("Max recovery retries ({}) reached, stopping capture", retry_count);
                    return Err(e.context(format!("capture stopped after {} retries", retry_count)));
                }
            }
        }
    }

    log::info!("Capture stopped, {} frames dropped", processor.dropped());
    Ok(())
}

// ======================== Playback thread ========================

/// Runs until `running` clears or every sender is gone. Returns `Err` when
/// the device is given up on.
fn playback_loop(
    mut device: Box<dyn OutputDevice>,
    mut processor: PlaybackProcessor,
    mut mailbox: PlaybackReceiver,
    quantum: usize,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let channels = device.channels().max(1);
    let mut out = vec![0.0f32; quantum * channels];
    let mut retry_count = 0u32;

    log::info!(
        "Playback started: rate={}, ch={}, quantum={}",
        device.sample_rate(),
        channels,
        quantum,
    );

    while running.load(Ordering::Relaxed) {
        // Flushes and frames since the last quantum, so a clear takes effect
        // on the very next render.
        if !mailbox.apply_pending(&mut processor) {
            log::info!("Playback channel closed");
            break;
        }

        processor.render(&mut out, channels, device.sample_rate());

        match device.write(&out) {
            Ok(()) => retry_count = 0,
            Err(e) => {
                log::warn!("Playback device error: {}, recovering...", e);
                retry_count += 1;
                if let Err(e2) = device.recover() {
                    log::error!("Failed to recover playback device: {}", e2);
                    return Err(e2.context("failed to recover playback device"));
                }
                // 熔断器：设备持续写入失败时放弃，交由会话层收尾
                if retry_count >= MAX_RECOVERY_RETRIES {
                    log::error!("Max recovery retries ({}) reached, stopping playback", retry_count);
                    return Err(e.context(format!("playback stopped after {} retries", retry_count)));
                }
            }
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ConstInput {
        value: f32,
    }

    impl InputDevice for ConstInput {
        fn sample_rate(&self) -> u32 {
            48000
        }
        fn read(&mut self, buf: &mut [f32]) -> anyhow::Result<usize> {
            thread::sleep(Duration::from_millis(2));
            buf.fill(self.value);
            Ok(buf.len())
        }
    }

    struct RecordingOutput {
        written: Arc<Mutex<Vec<f32>>>,
    }

    impl OutputDevice for RecordingOutput {
        fn sample_rate(&self) -> u32 {
            24000
        }
        fn channels(&self) -> usize {
            1
        }
        fn write(&mut self, buf: &[f32]) -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(2));
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
    }

    struct TestDevices {
        fail_input: bool,
        fail_output: bool,
        written: Arc<Mutex<Vec<f32>>>,
    }

    impl AudioDevices for TestDevices {
        fn open_input(&self, _quantum: usize) -> anyhow::Result<Box<dyn InputDevice>> {
            if self.fail_input {
                anyhow::bail!("no microphone");
            }
            Ok(Box::new(ConstInput { value: 0.25 }))
        }
        fn open_output(&self, _quantum: usize) -> anyhow::Result<Box<dyn OutputDevice>> {
            if self.fail_output {
                anyhow::bail!("no speaker");
            }
            Ok(Box::new(RecordingOutput {
                written: self.written.clone(),
            }))
        }
    }

    fn devices(fail_input: bool, fail_output: bool) -> (Arc<TestDevices>, Arc<Mutex<Vec<f32>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let devices = Arc::new(TestDevices {
            fail_input,
            fail_output,
            written: written.clone(),
        });
        (devices, written)
    }

    fn settings() -> AudioSettings {
        AudioSettings {
            quantum_frames: 32,
            channel_capacity: 64,
        }
    }

    #[tokio::test]
    async fn test_capture_frames_reach_main_context() {
        let (devices, _) = devices(false, false);
        let mut engine = AudioEngine::start(devices, &settings()).await.unwrap();
        assert_eq!(engine.mic_rate(), 48000);
        assert_eq!(engine.output_rate(), 24000);

        let mut frames = engine.take_mic_frames().unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, vec![0.25; 32]);
        engine.stop();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_pushed_audio_is_rendered() {
        let (devices, written) = devices(false, false);
        let mut engine = AudioEngine::start(devices, &settings()).await.unwrap();
        assert!(engine.playback_sender().push(vec![0.5; 64], 24000));
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop();

        let written = written.lock().unwrap();
        assert_eq!(written.iter().filter(|&&s| s == 0.5).count(), 64);
    }

    #[tokio::test]
    async fn test_input_failure_aborts_start() {
        let (devices, _) = devices(true, false);
        let result = AudioEngine::start(devices, &settings()).await;
        assert!(matches!(result, Err(Error::Device(_))));
    }

    #[tokio::test]
    async fn test_output_failure_stops_capture() {
        let (devices, _) = devices(false, true);
        let result = AudioEngine::start(devices, &settings()).await;
        assert!(matches!(result, Err(Error::Device(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (devices, _) = devices(false, false);
        let mut engine = AudioEngine::start(devices, &settings()).await.unwrap();
        engine.stop();
        engine.stop();
        assert!(engine.take_mic_frames().is_none());
    }

    struct UnpluggedOutput;

    impl OutputDevice for UnpluggedOutput {
        fn sample_rate(&self) -> u32 {
            24000
        }
        fn channels(&self) -> usize {
            1
        }
        fn write(&mut self, _buf: &[f32]) -> anyhow::Result<()> {
            anyhow::bail!("device unplugged")
        }
    }

    struct UnpluggedSpeaker;

    impl AudioDevices for UnpluggedSpeaker {
        fn open_input(&self, _quantum: usize) -> anyhow::Result<Box<dyn InputDevice>> {
            Ok(Box::new(ConstInput { value: 0.0 }))
        }
        fn open_output(&self, _quantum: usize) -> anyhow::Result<Box<dyn OutputDevice>> {
            Ok(Box::new(UnpluggedOutput))
        }
    }

    #[tokio::test]
    async fn test_dead_device_is_reported_as_fault() {
        let mut engine = AudioEngine::start(Arc::new(UnpluggedSpeaker), &settings())
            .await
            .unwrap();
        let mut faults = engine.take_faults().unwrap();
        let fault = tokio::time::timeout(Duration::from_secs(2), faults.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(format!("{:#}", fault).contains("device unplugged"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_joins_threads_without_faults() {
        let (devices, _) = devices(false, false);
        let mut engine = AudioEngine::start(devices, &settings()).await.unwrap();
        let mut faults = engine.take_faults().unwrap();
        tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
            .await
            .unwrap();
        // Both threads ended cleanly: the channel closes with nothing in it.
        assert!(faults.recv().await.is_none());
    }
}
