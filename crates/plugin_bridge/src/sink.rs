//! Device write-back path.

use bytes::Bytes;
use tracing::warn;

/// Receives bytes plugins want written to the connected device.
///
/// Implementations must not block; the bridge calls this from its reactor.
pub trait DeviceSink: Send + Sync {
    fn write_back(&self, bytes: Bytes);
}

impl DeviceSink for flume::Sender<Bytes> {
    fn write_back(&self, bytes: Bytes) {
        if self.send(bytes).is_err() {
            warn!("Device write-back channel closed, dropping plugin data");
        }
    }
}

/// Sink for hosts without a writable device; plugin data is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl DeviceSink for DiscardSink {
    fn write_back(&self, _bytes: Bytes) {}
}
