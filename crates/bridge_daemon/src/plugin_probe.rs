//! Minimal plugin client for poking at a running bridge.
//!
//! Prints a summary of every line the bridge sends and forwards each line typed
//! on stdin to the device.

use anyhow::{Context, Result};
use bridge_types::DEFAULT_PLUGIN_PORT;
use clap::{Arg, Command};
use plugin_bridge::wire::{decode_line, PluginMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("plugin_probe")
        .about("Connects to a plugin bridge and prints what it streams")
        .arg(
            Arg::new("addr")
                .value_name("HOST:PORT")
                .help("Address of the plugin bridge [default: 127.0.0.1:7777]"),
        )
        .get_matches();

    let addr = matches
        .get_one::<String>("addr")
        .cloned()
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PLUGIN_PORT));

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Could not connect to plugin bridge at {}", addr))?;
    info!("connected to {}", addr);

    let (reader, mut writer) = stream.into_split();
    let mut bridge_lines = BufReader::new(reader).lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = bridge_lines.next_line() => match line? {
                Some(line) => print_line(&line),
                None => {
                    info!("Bridge closed the connection");
                    break;
                }
            },
            line = stdin_lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn print_line(line: &str) {
    match decode_line(line) {
        Ok(PluginMessage::Frames { frames }) => {
            println!("frames: {}", frames.len());
            for frame in frames {
                println!("  {}", frame.data);
            }
        }
        Ok(message @ PluginMessage::Raw { .. }) => match message.raw_bytes() {
            Some(Ok(bytes)) => println!("raw: {:?}", String::from_utf8_lossy(&bytes)),
            _ => warn!("Raw line carried invalid base64: {}", line),
        },
        Err(e) => warn!("Unrecognized line from bridge ({}): {}", e, line),
    }
}
