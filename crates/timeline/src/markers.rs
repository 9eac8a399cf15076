/// Timeline markers
use serde::{Deserialize, Serialize};

use crate::Time;

string_id!(MarkerId);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerType {
    #[default]
    Standard,
    In,
    Out,
    Chapter,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub id: MarkerId,
    pub time: Time,
    pub label: String,
    #[serde(default)]
    pub marker_type: MarkerType,

    /// Color in hex format (e.g., "#FF0000")
    #[serde(default = "default_marker_color")]
    pub color: String,

    #[serde(default)]
    pub note: String,
}

fn default_marker_color() -> String {
    "#4A9EFF".to_string()
}

impl Marker {
    pub fn new(time: Time, label: impl Into<String>) -> Self {
        Self {
            id: MarkerId::new(),
            time,
            label: label.into(),
            marker_type: MarkerType::Standard,
            color: default_marker_color(),
            note: String::new(),
        }
    }
}
