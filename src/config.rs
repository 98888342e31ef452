use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{AggregatorSettings, AudioSettings};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub health_check: bool,
    pub ping_interval_secs: u64,
    pub queue_capacity: usize,

    // 会话配置，连接后随 config 消息发送
    pub system_instruction: Option<String>,
    pub response_modalities: Option<Vec<String>>,
    pub model: Option<String>,

    // 音频设备配置
    pub capture_device: String,
    pub playback_device: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    pub quantum_frames: usize,
    pub default_inbound_rate: u32,
    pub channel_capacity: usize,

    // 麦克风上行节奏
    pub mic_batch_quanta: usize,
    pub mic_transmit_rate: u32,
    pub mic_send_pace_ms: u64,
    pub mic_max_pending_batches: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            health_check: env!("HEALTH_CHECK").parse()
                .map_err(|_| "Failed to parse HEALTH_CHECK")?,
            ping_interval_secs: env!("PING_INTERVAL_SECS").parse()
                .map_err(|_| "Failed to parse PING_INTERVAL_SECS")?,
            queue_capacity: env!("QUEUE_CAPACITY").parse()
                .map_err(|_| "Failed to parse QUEUE_CAPACITY")?,

            system_instruction: non_empty(env!("SYSTEM_INSTRUCTION")),
            response_modalities: split_list(env!("RESPONSE_MODALITIES")),
            model: non_empty(env!("MODEL")),

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            playback_channels: env!("PLAYBACK_CHANNELS").parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            quantum_frames: env!("QUANTUM_FRAMES").parse()
                .map_err(|_| "Failed to parse QUANTUM_FRAMES")?,
            default_inbound_rate: env!("DEFAULT_INBOUND_RATE").parse()
                .map_err(|_| "Failed to parse DEFAULT_INBOUND_RATE")?,
            channel_capacity: env!("CHANNEL_CAPACITY").parse()
                .map_err(|_| "Failed to parse CHANNEL_CAPACITY")?,

            mic_batch_quanta: env!("MIC_BATCH_QUANTA").parse()
                .map_err(|_| "Failed to parse MIC_BATCH_QUANTA")?,
            mic_transmit_rate: env!("MIC_TRANSMIT_RATE").parse()
                .map_err(|_| "Failed to parse MIC_TRANSMIT_RATE")?,
            mic_send_pace_ms: env!("MIC_SEND_PACE_MS").parse()
                .map_err(|_| "Failed to parse MIC_SEND_PACE_MS")?,
            mic_max_pending_batches: env!("MIC_MAX_PENDING_BATCHES").parse()
                .map_err(|_| "Failed to parse MIC_MAX_PENDING_BATCHES")?,
        })
    }

    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            quantum_frames: self.quantum_frames.max(1),
            channel_capacity: self.channel_capacity.max(1),
        }
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            batch_quanta: self.mic_batch_quanta.max(1),
            transmit_rate: self.mic_transmit_rate,
            send_pace: Duration::from_millis(self.mic_send_pace_ms),
            max_pending_batches: self.mic_max_pending_batches.max(1),
        }
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn split_list(value: &str) -> Option<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_time_config_parses() {
        let config = Config::new().unwrap();
        assert!(config.ws_url.starts_with("ws"));
        assert!(config.quantum_frames > 0);
        assert_eq!(config.mic_transmit_rate, 16000);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("AUDIO, TEXT"),
            Some(vec!["AUDIO".to_string(), "TEXT".to_string()])
        );
        assert_eq!(split_list(" , "), None);
    }

    #[test]
    fn test_empty_model_means_none() {
        assert_eq!(non_empty("   "), None);
        assert_eq!(non_empty("m1"), Some("m1".to_string()));
    }

    #[test]
    fn test_zero_ping_interval_disables_ping() {
        let config = Config {
            ping_interval_secs: 0,
            ..Config::new().unwrap()
        };
        assert!(config.ping_interval().is_none());
    }
}
