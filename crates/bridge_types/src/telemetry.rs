//! Telemetry records produced by the frame-decoding pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single measured value within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Position of the value within the raw device line (1-based)
    pub index: usize,
    pub title: String,
    /// The value exactly as decoded from the device
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
}

/// A named collection of datasets that belong together (e.g. one sensor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub title: String,
    pub datasets: Vec<Dataset>,
}

/// One decoded telemetry frame.
///
/// Frames are immutable once built and are handed to the bridge as-is; the
/// bridge only ever serializes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub title: String,
    /// Monotonic frame counter for detecting gaps on the plugin side
    pub frame_id: u64,
    /// Wall-clock time at which the frame was decoded
    pub timestamp: DateTime<Utc>,
    pub groups: Vec<Group>,
}

impl TelemetryFrame {
    pub fn new(title: impl Into<String>, frame_id: u64) -> Self {
        Self {
            title: title.into(),
            frame_id,
            timestamp: Utc::now(),
            groups: Vec::new(),
        }
    }

    /// Appends a group, builder style.
    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    /// Total number of datasets across all groups.
    pub fn dataset_count(&self) -> usize {
        self.groups.iter().map(|g| g.datasets.len()).sum()
    }

    /// Renders the frame the way a device streams it: comma separated values
    /// ordered by dataset index, terminated by a newline.
    pub fn to_csv_line(&self) -> String {
        let mut datasets: Vec<&Dataset> =
            self.groups.iter().flat_map(|g| g.datasets.iter()).collect();
        datasets.sort_by_key(|d| d.index);

        let mut line = datasets
            .iter()
            .map(|d| d.value.as_str())
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(index: usize, title: &str, value: &str) -> Dataset {
        Dataset {
            index,
            title: title.to_string(),
            value: value.to_string(),
            units: String::new(),
        }
    }

    #[test]
    fn test_csv_line_follows_dataset_index() {
        let frame = TelemetryFrame::new("probe", 7)
            .with_group(Group {
                title: "b".to_string(),
                datasets: vec![dataset(3, "z", "30"), dataset(2, "y", "20")],
            })
            .with_group(Group {
                title: "a".to_string(),
                datasets: vec![dataset(1, "x", "10")],
            });

        assert_eq!(frame.dataset_count(), 3);
        assert_eq!(frame.to_csv_line(), "10,20,30\n");
    }

    #[test]
    fn test_empty_units_are_omitted() {
        let value = serde_json::to_value(dataset(1, "x", "1")).unwrap();
        assert!(value.get("units").is_none());
    }
}
