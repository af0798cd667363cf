//! A simulated device standing in for real hardware.
//!
//! Every period it decodes one "sample" into a [`TelemetryFrame`], streams the
//! same sample as a raw CSV line, and hands both to the bridge, the way a serial
//! device and its frame parser would. Bytes plugins write back are logged and,
//! optionally, echoed on the raw channel.

use std::f64::consts::PI;
use std::time::{Duration, Instant};

use bridge_types::{Dataset, Group, TelemetryFrame};
use bytes::Bytes;
use plugin_bridge::BridgeHandle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MockDeviceConfig;

const AMPLITUDE: f64 = 100.0;

pub struct MockDevice {
    config: MockDeviceConfig,
    frame_id: u64,
    started: Instant,
}

impl MockDevice {
    pub fn new(config: MockDeviceConfig) -> Self {
        Self {
            config,
            frame_id: 0,
            started: Instant::now(),
        }
    }

    /// Builds the next frame. Channel `i` is a sine wave at `2 + 4*i` Hz.
    pub fn next_frame(&mut self) -> TelemetryFrame {
        let t_secs = self.started.elapsed().as_secs_f64();
        let datasets = (0..self.config.channels)
            .map(|i| {
                let freq = 2.0 + (i as f64) * 4.0;
                let value = (2.0 * PI * freq * t_secs).sin() * AMPLITUDE;
                Dataset {
                    index: i + 1,
                    title: format!("Channel {}", i + 1),
                    value: format!("{:.3}", value),
                    units: "mV".to_string(),
                }
            })
            .collect();

        self.frame_id += 1;
        TelemetryFrame::new(self.config.title.clone(), self.frame_id).with_group(Group {
            title: "Sine".to_string(),
            datasets,
        })
    }

    /// Runs the device until `shutdown` is cancelled.
    pub fn spawn(
        mut self,
        bridge: BridgeHandle,
        write_back: flume::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.frame_rate_hz.max(1)));

        tokio::spawn(async move {
            info!(
                title = %self.config.title,
                channels = self.config.channels,
                rate_hz = self.config.frame_rate_hz,
                "Mock device started"
            );
            let mut samples = interval(period);
            samples.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    Ok(bytes) = write_back.recv_async() => self.on_write_back(&bridge, bytes),
                    _ = samples.tick() => {
                        if !self.emit(&bridge) {
                            warn!("Plugin bridge is gone, stopping mock device");
                            break;
                        }
                    }
                }
            }
            info!(frames = self.frame_id, "Mock device stopped");
        })
    }

    fn emit(&mut self, bridge: &BridgeHandle) -> bool {
        let frame = self.next_frame();
        let line = frame.to_csv_line();
        bridge.on_raw_bytes(line.into_bytes()).is_ok() && bridge.register_frame(frame).is_ok()
    }

    fn on_write_back(&self, bridge: &BridgeHandle, bytes: Bytes) {
        info!(
            bytes = bytes.len(),
            text = %String::from_utf8_lossy(&bytes).trim_end(),
            "Device received plugin data"
        );
        if self.config.echo_write_back {
            if let Err(e) = bridge.on_raw_bytes(bytes) {
                debug!("Failed to echo plugin data: {}", e);
            }
        }
    }
}
