use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    network: Network,
    session: Session,
    audio: Audio,
    mic: Mic,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    health_check: bool,
    ping_interval_secs: u64,
    queue_capacity: usize,
}

#[derive(Deserialize)]
struct Session {
    system_instruction: String,
    response_modalities: Vec<String>,
    model: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    playback_sample_rate: u32,
    playback_channels: u32,
    quantum_frames: usize,
    default_inbound_rate: u32,
    channel_capacity: usize,
}

#[derive(Deserialize)]
struct Mic {
    batch_quanta: usize,
    transmit_rate: u32,
    send_pace_ms: u64,
    max_pending_batches: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=HEALTH_CHECK={}", config.network.health_check);
    println!("cargo:rustc-env=PING_INTERVAL_SECS={}", config.network.ping_interval_secs);
    println!("cargo:rustc-env=QUEUE_CAPACITY={}", config.network.queue_capacity);

    // Session configuration sent to the agent after connect.
    // Newlines would break the env var, so the instruction stays on one line.
    println!(
        "cargo:rustc-env=SYSTEM_INSTRUCTION={}",
        config.session.system_instruction.replace('\n', " ")
    );
    println!(
        "cargo:rustc-env=RESPONSE_MODALITIES={}",
        config.session.response_modalities.join(",")
    );
    println!("cargo:rustc-env=MODEL={}", config.session.model);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.audio.playback_sample_rate);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=QUANTUM_FRAMES={}", config.audio.quantum_frames);
    println!("cargo:rustc-env=DEFAULT_INBOUND_RATE={}", config.audio.default_inbound_rate);
    println!("cargo:rustc-env=CHANNEL_CAPACITY={}", config.audio.channel_capacity);

    // Mic uplink pacing
    println!("cargo:rustc-env=MIC_BATCH_QUANTA={}", config.mic.batch_quanta);
    println!("cargo:rustc-env=MIC_TRANSMIT_RATE={}", config.mic.transmit_rate);
    println!("cargo:rustc-env=MIC_SEND_PACE_MS={}", config.mic.send_pace_ms);
    println!("cargo:rustc-env=MIC_MAX_PENDING_BATCHES={}", config.mic.max_pending_batches);
}
