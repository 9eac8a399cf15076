//! In-place edit primitives for [`TimelineState`].
//!
//! Every primitive validates before touching the state, so an `Err` leaves the
//! timeline exactly as it was.

use serde_json::{Map, Value};

use crate::{Clip, ClipId, Result, Time, TimelineError, TimelineState, Track, TrackId};

/// Position of a clip as `(track index, clip index)`.
pub fn clip_index(state: &TimelineState, clip_id: &ClipId) -> Option<(usize, usize)> {
    state.tracks.iter().enumerate().find_map(|(t, track)| {
        track
            .clips
            .iter()
            .position(|c| &c.id == clip_id)
            .map(|c| (t, c))
    })
}

pub fn find_clip<'a>(state: &'a TimelineState, clip_id: &ClipId) -> Option<&'a Clip> {
    clip_index(state, clip_id).map(|(t, c)| &state.tracks[t].clips[c])
}

pub fn clip_mut<'a>(state: &'a mut TimelineState, clip_id: &ClipId) -> Option<&'a mut Clip> {
    let (t, c) = clip_index(state, clip_id)?;
    Some(&mut state.tracks[t].clips[c])
}

/// Track that currently holds the clip.
pub fn track_of<'a>(state: &'a TimelineState, clip_id: &ClipId) -> Option<&'a TrackId> {
    clip_index(state, clip_id).map(|(t, _)| &state.tracks[t].id)
}

pub fn clip_ids(state: &TimelineState) -> Vec<ClipId> {
    state.clips().map(|c| c.id.clone()).collect()
}

fn track_position(state: &TimelineState, track_id: &TrackId) -> Result<usize> {
    state
        .tracks
        .iter()
        .position(|t| &t.id == track_id)
        .ok_or_else(|| TimelineError::TrackNotFound(track_id.clone()))
}

fn check_range(start: Time, end: Time) -> Result<()> {
    if start > end || start.is_nan() || end.is_nan() {
        return Err(TimelineError::InvalidRange { start, end });
    }
    Ok(())
}

pub fn insert_track(state: &mut TimelineState, track: Track) -> Result<()> {
    if state.track(&track.id).is_some() {
        return Err(TimelineError::TrackExists(track.id));
    }
    state.tracks.push(track);
    Ok(())
}

pub fn remove_track(state: &mut TimelineState, track_id: &TrackId) -> Result<Track> {
    let idx = track_position(state, track_id)?;
    Ok(state.tracks.remove(idx))
}

/// Appends `clip` to the end of the named track's clip list.
pub fn insert_clip(state: &mut TimelineState, track_id: &TrackId, clip: Clip) -> Result<()> {
    let idx = track_position(state, track_id)?;
    if clip_index(state, &clip.id).is_some() {
        return Err(TimelineError::ClipExists(clip.id));
    }
    check_range(clip.start_time, clip.end_time)?;
    state.tracks[idx].clips.push(clip);
    Ok(())
}

pub fn remove_clip(state: &mut TimelineState, clip_id: &ClipId) -> Result<Clip> {
    let (t, c) =
        clip_index(state, clip_id).ok_or_else(|| TimelineError::ClipNotFound(clip_id.clone()))?;
    Ok(state.tracks[t].clips.remove(c))
}

/// Shallow-merges `changes` over the clip's JSON form.
///
/// Top-level keys replace the clip's fields wholesale (nested objects such as
/// `transform` are not merged recursively). The `id` key is ignored.
pub fn merge_clip_changes(
    state: &mut TimelineState,
    clip_id: &ClipId,
    changes: &Map<String, Value>,
) -> Result<()> {
    let (t, c) =
        clip_index(state, clip_id).ok_or_else(|| TimelineError::ClipNotFound(clip_id.clone()))?;

    let invalid = |reason: String| TimelineError::InvalidChange {
        clip: clip_id.clone(),
        reason,
    };

    let mut json = serde_json::to_value(&state.tracks[t].clips[c]).map_err(|e| invalid(e.to_string()))?;
    if let Value::Object(fields) = &mut json {
        for (key, value) in changes {
            if key == "id" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
    }

    let merged: Clip = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
    check_range(merged.start_time, merged.end_time)?;
    state.tracks[t].clips[c] = merged;
    Ok(())
}

/// Removes the clip from its track and re-inserts it at the end of `to_track`
/// with the new time range.
pub fn move_clip(
    state: &mut TimelineState,
    clip_id: &ClipId,
    to_track: &TrackId,
    start: Time,
    end: Time,
) -> Result<()> {
    check_range(start, end)?;
    let target = track_position(state, to_track)?;
    let (t, c) =
        clip_index(state, clip_id).ok_or_else(|| TimelineError::ClipNotFound(clip_id.clone()))?;

    let mut clip = state.tracks[t].clips.remove(c);
    clip.start_time = start;
    clip.end_time = end;
    state.tracks[target].clips.push(clip);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackKind;
    use serde_json::json;

    fn two_tracks() -> TimelineState {
        let mut state = TimelineState::default();
        insert_track(&mut state, Track::new("t1", TrackKind::Video, 0)).unwrap();
        insert_track(&mut state, Track::new("t2", TrackKind::Video, 1)).unwrap();
        state
    }

    #[test]
    fn insert_and_remove_clip() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();
        assert_eq!(state.clip_count(), 1);
        assert_eq!(track_of(&state, &"c1".into()).unwrap().as_str(), "t1");

        let removed = remove_clip(&mut state, &"c1".into()).unwrap();
        assert_eq!(removed.id.as_str(), "c1");
        assert_eq!(state.clip_count(), 0);
    }

    #[test]
    fn insert_into_missing_track_fails_without_change() {
        let mut state = two_tracks();
        let before = state.clone();
        let err = insert_clip(&mut state, &"nope".into(), Clip::new("c1", "a1", 0.0, 5.0));
        assert!(matches!(err, Err(TimelineError::TrackNotFound(_))));
        assert_eq!(state, before);
    }

    #[test]
    fn duplicate_clip_id_is_rejected() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();
        let err = insert_clip(&mut state, &"t2".into(), Clip::new("c1", "a1", 9.0, 12.0));
        assert!(matches!(err, Err(TimelineError::ClipExists(_))));
    }

    #[test]
    fn merge_changes_is_shallow() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();

        let changes = json!({ "endTime": 7.5, "locked": true, "transform": { "x": 10.0, "y": 0.0, "scale": 2.0, "rotation": 0.0, "opacity": 0.5 } });
        merge_clip_changes(&mut state, &"c1".into(), changes.as_object().unwrap()).unwrap();

        let clip = find_clip(&state, &"c1".into()).unwrap();
        assert_eq!(clip.end_time, 7.5);
        assert!(clip.locked);
        assert_eq!(clip.transform.scale, 2.0);
        assert_eq!(clip.start_time, 0.0);
    }

    #[test]
    fn merge_changes_rejects_bad_types() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();
        let before = state.clone();

        let changes = json!({ "startTime": "soon" });
        let err = merge_clip_changes(&mut state, &"c1".into(), changes.as_object().unwrap());
        assert!(matches!(err, Err(TimelineError::InvalidChange { .. })));
        assert_eq!(state, before);
    }

    #[test]
    fn move_clip_between_tracks() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();

        move_clip(&mut state, &"c1".into(), &"t2".into(), 10.0, 15.0).unwrap();

        assert!(state.track(&"t1".into()).unwrap().clips.is_empty());
        let clip = state.track(&"t2".into()).unwrap().clip(&"c1".into()).unwrap();
        assert_eq!(clip.range(), crate::TimeRange::new(10.0, 15.0));
    }

    #[test]
    fn move_to_missing_track_keeps_clip() {
        let mut state = two_tracks();
        insert_clip(&mut state, &"t1".into(), Clip::new("c1", "a1", 0.0, 5.0)).unwrap();
        assert!(move_clip(&mut state, &"c1".into(), &"t9".into(), 1.0, 2.0).is_err());
        assert!(find_clip(&state, &"c1".into()).is_some());
    }
}
