use std::sync::Arc;

use live_voice_client::audio::AlsaDevices;
use live_voice_client::{Config, SessionEvent, VoiceSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，命令行第一个参数可覆盖服务器地址
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    if let Some(url) = std::env::args().nth(1) {
        config.ws_url = url;
    }

    let devices = Arc::new(AlsaDevices::from_config(&config));
    let (mut session, mut events) = VoiceSession::new(config.clone(), devices);

    println!("Connecting to {} ...", config.ws_url);
    session.connect().await?;
    println!("Type to chat, /interrupt to cut the agent off, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "" => {}
                        "/quit" => break,
                        "/interrupt" => session.interrupt(),
                        text => {
                            if !session.send_text(text) {
                                eprintln!("Not connected, message not sent");
                            }
                        }
                    },
                    // stdin 关闭后只保留语音
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        eprintln!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }

            Some(event) = events.recv() => {
                println!("{}", event);
                if event == SessionEvent::Disconnected {
                    break;
                }
            }
        }
    }

    session.disconnect().await;
    Ok(())
}
