//! The frame capability consumed by the bridge.
//!
//! Frames are produced by the decoding pipeline at arbitrary times. The bridge
//! never looks inside one; all it needs is a self-describing JSON rendition of
//! the record at broadcast time.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// A structured record that can be rendered as a JSON payload.
pub trait Frame: Send + Sync + Debug {
    /// Renders the frame into the value placed under `"data"` on the wire.
    fn to_payload(&self) -> serde_json::Result<Value>;
}

impl<T> Frame for T
where
    T: Serialize + Send + Sync + Debug,
{
    fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Frames are immutable once produced, so they are shared rather than copied.
pub type SharedFrame = Arc<dyn Frame>;
