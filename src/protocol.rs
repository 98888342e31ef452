//! JSON messages exchanged with the agent backend over the WebSocket.

use serde::{Deserialize, Serialize};

/// Client → server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Config {
        #[serde(skip_serializing_if = "Option::is_none")]
        system_instruction: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_modalities: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Audio {
        data: String,
        mime_type: String,
    },
    Text {
        text: String,
    },
    Interrupt,
    Ping,
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Config { .. } => "config",
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Text { .. } => "text",
            ClientMessage::Interrupt => "interrupt",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Server → client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {
        #[serde(default)]
        model: String,
    },
    Audio {
        data: String,
        #[serde(default)]
        mime_type: Option<String>,
    },
    Text {
        text: String,
    },
    Interrupted,
    Error {
        #[serde(default)]
        message: String,
    },
    Pong,
}

pub fn pcm_mime_type(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Extract the `rate` parameter from a mime descriptor such as
/// `audio/pcm;rate=24000`.
pub fn pcm_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok().filter(|&r| r > 0)
        } else {
            None
        }
    })
}
