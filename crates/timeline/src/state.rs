use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{AssetId, ClipId, EffectId, Marker, Time, TrackId};

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Time,
    pub end: Time,
}

impl TimeRange {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Time {
        self.end - self.start
    }

    /// Ranges that merely touch (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !(self.end <= other.start || other.end <= self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trim {
    #[serde(default)]
    pub start: Time,
    #[serde(default)]
    pub end: Time,
}

impl Default for Trim {
    fn default() -> Self {
        Self { start: 0.0, end: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub rotation: f64,
    pub opacity: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            rotation: 0.0,
            opacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Effect {
    pub id: EffectId,
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Dissolve,
    Wipe,
    Slide,
    Custom(String),
}

impl Default for TransitionKind {
    fn default() -> Self {
        Self::Dissolve
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    #[serde(default)]
    pub kind: TransitionKind,
    pub duration: Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: ClipId,
    pub asset_id: AssetId,
    pub start_time: Time,
    pub end_time: Time,
    #[serde(default)]
    pub trim: Trim,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub effects: Vec<Effect>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub edited_by: Option<String>,
    #[serde(default)]
    pub edited_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Clip {
    pub fn new(id: impl Into<ClipId>, asset_id: impl Into<AssetId>, start: Time, end: Time) -> Self {
        Self {
            id: id.into(),
            asset_id: asset_id.into(),
            start_time: start,
            end_time: end,
            trim: Trim::default(),
            transform: Transform::default(),
            effects: Vec::new(),
            transitions: Vec::new(),
            locked: false,
            edited_by: None,
            edited_at: None,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Text,
    Effect,
}

impl Default for TrackKind {
    fn default() -> Self {
        Self::Video
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    #[serde(rename = "type", default)]
    pub kind: TrackKind,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub order: u32,
}

impl Track {
    pub fn new(id: impl Into<TrackId>, kind: TrackKind, order: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            clips: Vec::new(),
            muted: false,
            locked: false,
            order,
        }
    }

    pub fn clip(&self, clip_id: &ClipId) -> Option<&Clip> {
        self.clips.iter().find(|c| &c.id == clip_id)
    }

    /// Pairs of clips on this track whose time ranges overlap.
    pub fn overlapping_clips(&self) -> Vec<(&Clip, &Clip)> {
        let mut pairs = Vec::new();
        for (i, a) in self.clips.iter().enumerate() {
            for b in &self.clips[i + 1..] {
                if a.range().overlaps(&b.range()) {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub start: Time,
    pub end: Time,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub playhead: Time,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub selected_clips: Vec<ClipId>,
    #[serde(default)]
    pub markers: Vec<Marker>,
}

fn default_zoom() -> f64 {
    1.0
}

impl Default for TimelineState {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            playhead: 0.0,
            zoom: default_zoom(),
            viewport: Viewport::default(),
            selected_clips: Vec::new(),
            markers: Vec::new(),
        }
    }
}

impl TimelineState {
    pub fn track(&self, track_id: &TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| &t.id == track_id)
    }

    pub fn clip_count(&self) -> usize {
        self.tracks.iter().map(|t| t.clips.len()).sum()
    }

    pub fn clips(&self) -> impl Iterator<Item = &Clip> {
        self.tracks.iter().flat_map(|t| t.clips.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Audio,
    Image,
}

/// Media referenced by clips. The media itself lives outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub kind: AssetKind,
    #[serde(default)]
    pub duration: Option<Time>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub type AssetLibrary = BTreeMap<AssetId, Asset>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_open_ranges_touching_do_not_overlap() {
        let a = TimeRange::new(0.0, 10.0);
        assert!(a.overlaps(&TimeRange::new(5.0, 15.0)));
        assert!(!a.overlaps(&TimeRange::new(10.0, 20.0)));
        assert!(!TimeRange::new(10.0, 20.0).overlaps(&a));
    }

    #[test]
    fn clip_serializes_with_camel_case_keys() {
        let clip = Clip::new("c1", "a1", 0.0, 5.0);
        let json = serde_json::to_value(&clip).unwrap();
        assert_eq!(json["startTime"], 0.0);
        assert_eq!(json["endTime"], 5.0);
        assert_eq!(json["assetId"], "a1");
    }

    #[test]
    fn track_reports_overlapping_clips() {
        let mut track = Track::new("t1", TrackKind::Video, 0);
        track.clips.push(Clip::new("c1", "a", 0.0, 5.0));
        track.clips.push(Clip::new("c2", "a", 3.0, 8.0));
        track.clips.push(Clip::new("c3", "a", 8.0, 9.0));

        let pairs = track.overlapping_clips();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.id.as_str(), "c1");
        assert_eq!(pairs[0].1.id.as_str(), "c2");
    }
}
