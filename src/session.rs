//! Per-connection voice session: the surface the UI layer drives.
//!
//! A session pairs one transport link with one audio engine. Connecting
//! starts both; the socket closing (for any reason) tears the audio side down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AudioDevices, AudioEngine, MicAggregator, PlaybackSender};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{self, HealthResult};
use crate::net_link::{NetEvent, TransportClient};
use crate::protocol::{self, ClientMessage, ServerMessage};

const EVENT_QUEUE_CAPACITY: usize = 100;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipeline events surfaced to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The backend accepted the session.
    Connected { model: String },
    Text(String),
    /// Playback was flushed (server barge-in).
    Interrupted,
    Error(String),
    Disconnected,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connected { model } => write!(f, "session ready (model: {})", model),
            SessionEvent::Text(text) => write!(f, "agent: {}", text),
            SessionEvent::Interrupted => write!(f, "playback interrupted"),
            SessionEvent::Error(message) => write!(f, "error: {}", message),
            SessionEvent::Disconnected => write!(f, "disconnected"),
        }
    }
}

pub struct VoiceSession {
    config: Config,
    devices: Arc<dyn AudioDevices>,
    transport: TransportClient,
    events: mpsc::Sender<SessionEvent>,
    playback: Option<PlaybackSender>,
    aggregator: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn new(config: Config, devices: Arc<dyn AudioDevices>) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let transport = TransportClient::new(config.queue_capacity);
        (
            Self {
                config,
                devices,
                transport,
                events,
                playback: None,
                aggregator: None,
                dispatcher: None,
            },
            events_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Start audio, open the socket and send the session config.
    ///
    /// Any failure tears down what was already built, emits one
    /// `SessionEvent::Error` and returns the error.
    pub async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;

        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Connect failed: {}", e);
                self.emit(SessionEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn try_connect(&mut self) -> Result<()> {
        if self.config.health_check {
            match health::check_backend_health(&self.config.ws_url).await {
                HealthResult::Healthy => log::info!("Backend healthy"),
                HealthResult::Unhealthy(msg) | HealthResult::Error(msg) => {
                    return Err(Error::Health(msg));
                }
            }
        }

        // Audio first: a missing microphone must not leave a half-open socket.
        let mut engine = AudioEngine::start(self.devices.clone(), &self.config.audio_settings()).await?;
        let (Some(mic_frames), Some(faults)) = (engine.take_mic_frames(), engine.take_faults()) else {
            engine.shutdown().await;
            return Err(Error::NotConnected);
        };

        let (net_tx, net_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        if let Err(e) = self.transport.connect(&self.config.ws_url, net_tx).await {
            engine.shutdown().await;
            return Err(e);
        }

        self.transport.send(&ClientMessage::Config {
            system_instruction: self.config.system_instruction.clone(),
            response_modalities: self.config.response_modalities.clone(),
            model: self.config.model.clone(),
        });

        let session_id = Uuid::new_v4();
        log::info!(
            "Session {} started: mic {}Hz -> {}Hz uplink, playback {}Hz",
            session_id,
            engine.mic_rate(),
            self.config.mic_transmit_rate,
            engine.output_rate(),
        );

        let aggregator = MicAggregator::new(engine.mic_rate(), self.config.aggregator_settings());
        let link = self.transport.clone();
        self.aggregator = Some(tokio::spawn(async move {
            aggregator.run(mic_frames, &link).await;
        }));

        let playback = engine.playback_sender();
        self.playback = Some(playback.clone());

        let dispatcher = Dispatcher {
            engine: Some(engine),
            playback,
            transport: self.transport.clone(),
            events: self.events.clone(),
            default_inbound_rate: self.config.default_inbound_rate,
        };
        let ping_interval = self.config.ping_interval();
        self.dispatcher = Some(tokio::spawn(dispatcher.run(net_rx, faults, ping_interval)));

        Ok(())
    }

    /// Close the socket and release the audio devices. Safe to call in any
    /// state, any number of times.
    pub async fn disconnect(&mut self) {
        self.transport.close();
        self.playback = None;

        if let Some(mut dispatcher) = self.dispatcher.take() {
            // The dispatcher sees `Closed`, stops the engine and exits.
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut dispatcher).await.is_err() {
                log::warn!("Dispatcher did not stop in time, aborting");
                dispatcher.abort();
                let _ = dispatcher.await;
                self.emit(SessionEvent::Disconnected).await;
            }
        }
        if let Some(aggregator) = self.aggregator.take() {
            aggregator.abort();
        }
    }

    /// Send typed user input. Returns whether it was queued.
    pub fn send_text(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || !self.transport.is_open() {
            return false;
        }
        self.transport.send(&ClientMessage::Text {
            text: text.to_string(),
        });
        true
    }

    /// User barge-in: flush local playback now and tell the agent.
    pub fn interrupt(&self) {
        if let Some(playback) = &self.playback {
            playback.clear();
        }
        self.transport.send(&ClientMessage::Interrupt);
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Routes inbound server messages into the pipeline. Owns the audio engine,
/// so the engine lives exactly as long as the socket, and a dead device
/// ends the socket too.
struct Dispatcher {
    engine: Option<AudioEngine>,
    playback: PlaybackSender,
    transport: TransportClient,
    events: mpsc::Sender<SessionEvent>,
    default_inbound_rate: u32,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<NetEvent>,
        mut faults: mpsc::Receiver<anyhow::Error>,
        ping_interval: Option<Duration>,
    ) {
        let mut ping = ping_interval.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                event = net_rx.recv() => {
                    match event {
                        Some(NetEvent::Message(message)) => self.handle_message(message).await,
                        Some(NetEvent::Closed) | None => break,
                    }
                }
                Some(fault) = faults.recv() => {
                    let err = Error::Device(fault);
                    log::error!("Audio pipeline failed: {}", err);
                    self.emit(SessionEvent::Error(err.to_string())).await;
                    break;
                }
                _ = async {
                    match ping.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.transport.send(&ClientMessage::Ping);
                }
            }
        }

        self.transport.close();
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }
        let _ = self.events.send(SessionEvent::Disconnected).await;
    }

    async fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ready { model } => {
                log::info!("Session ready, model={}", model);
                self.emit(SessionEvent::Connected { model }).await;
            }
            ServerMessage::Audio { data, mime_type } => {
                let rate = mime_type
                    .as_deref()
                    .and_then(protocol::pcm_rate_from_mime)
                    .unwrap_or(self.default_inbound_rate);
                match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => {
                        if !self.playback.push_pcm16(&bytes, rate) {
                            log::warn!("Playback queue full, dropping {} bytes", bytes.len());
                        }
                    }
                    Err(e) => log::warn!("Dropping audio chunk with bad base64: {}", e),
                }
            }
            ServerMessage::Text { text } => {
                self.emit(SessionEvent::Text(text)).await;
            }
            ServerMessage::Interrupted => {
                log::info!("Server interrupted playback");
                self.playback.clear();
                self.emit(SessionEvent::Interrupted).await;
            }
            ServerMessage::Error { message } => {
                log::warn!("Server error: {}", message);
                self.emit(SessionEvent::Error(message)).await;
            }
            ServerMessage::Pong => log::debug!("pong"),
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }
}
