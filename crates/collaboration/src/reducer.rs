/// Applies operations to a timeline
use timeline::{ClipId, TimelineState, TrackId};
use tracing::debug;

use crate::{
    CollaborationError, InsertClipPayload, InsertTrackPayload, ModifyPayload, MovePayload,
    Operation, OperationType, Result, TargetType,
};

/// Applies one operation in place.
///
/// On error the timeline is left untouched. Combinations without a defined
/// effect (effect and keyframe targets, modify/move on tracks) are no-ops.
pub fn apply_operation(state: &mut TimelineState, op: &Operation) -> Result<()> {
    let target = op.target.id.as_str();

    match (op.op_type, op.target.kind) {
        (OperationType::Insert, TargetType::Clip) => {
            let InsertClipPayload { track_id, clip } = op.payload_as()?;
            if clip.id.as_str() != target {
                return Err(CollaborationError::InvalidOp(format!(
                    "operation {} targets clip {} but embeds clip {}",
                    op.id, target, clip.id
                )));
            }
            timeline::insert_clip(state, &track_id, clip).map_err(|e| invalid(op, e))
        }

        (OperationType::Insert, TargetType::Track) => {
            let InsertTrackPayload { track } = op.payload_as()?;
            timeline::insert_track(state, track).map_err(|e| invalid(op, e))
        }

        (OperationType::Delete, TargetType::Clip) => {
            timeline::remove_clip(state, &ClipId::from(target))
                .map(|_| ())
                .map_err(|e| invalid(op, e))
        }

        (OperationType::Delete, TargetType::Track) => {
            timeline::remove_track(state, &TrackId::from(target))
                .map(|_| ())
                .map_err(|e| invalid(op, e))
        }

        (OperationType::Modify, TargetType::Clip) => {
            let ModifyPayload { changes } = op.payload_as()?;
            timeline::merge_clip_changes(state, &ClipId::from(target), &changes)
                .map_err(|e| invalid(op, e))
        }

        (OperationType::Move, TargetType::Clip) => {
            let MovePayload {
                track_id,
                start_time,
                end_time,
            } = op.payload_as()?;
            timeline::move_clip(state, &ClipId::from(target), &track_id, start_time, end_time)
                .map_err(|e| invalid(op, e))
        }

        (op_type, kind) => {
            debug!(
                operation = %op.id,
                "no timeline effect for {:?} on {:?} target", op_type, kind
            );
            Ok(())
        }
    }
}

/// Pure variant of [`apply_operation`].
pub fn reduce(state: &TimelineState, op: &Operation) -> Result<TimelineState> {
    let mut next = state.clone();
    apply_operation(&mut next, op)?;
    Ok(next)
}

fn invalid(op: &Operation, err: timeline::TimelineError) -> CollaborationError {
    CollaborationError::InvalidOp(format!("operation {} rejected: {}", op.id, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OperationTarget, UserId};
    use serde_json::json;
    use timeline::{Clip, Track, TrackKind};

    fn user() -> UserId {
        UserId::from("u1")
    }

    fn base() -> TimelineState {
        let mut state = TimelineState::default();
        state.tracks.push(Track::new("t1", TrackKind::Video, 0));
        state.tracks.push(Track::new("t2", TrackKind::Audio, 1));
        state
    }

    #[test]
    fn insert_modify_move_delete_clip() {
        let mut state = base();

        let insert = Operation::insert_clip(user(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));
        apply_operation(&mut state, &insert).unwrap();
        assert_eq!(state.clip_count(), 1);

        let changes = json!({ "locked": true });
        let modify = Operation::modify_clip(user(), &"c1".into(), changes.as_object().unwrap().clone());
        apply_operation(&mut state, &modify).unwrap();
        assert!(timeline::find_clip(&state, &"c1".into()).unwrap().locked);

        let mv = Operation::move_clip(user(), &"c1".into(), "t2".into(), 2.0, 7.0);
        apply_operation(&mut state, &mv).unwrap();
        let moved = state.track(&"t2".into()).unwrap().clip(&"c1".into()).unwrap();
        assert_eq!((moved.start_time, moved.end_time), (2.0, 7.0));
        assert!(moved.locked);

        let delete = Operation::delete_clip(user(), &"c1".into());
        apply_operation(&mut state, &delete).unwrap();
        assert_eq!(state.clip_count(), 0);
    }

    #[test]
    fn track_insert_and_delete() {
        let mut state = base();
        let insert = Operation::insert_track(user(), Track::new("t3", TrackKind::Text, 2));
        apply_operation(&mut state, &insert).unwrap();
        assert_eq!(state.tracks.len(), 3);

        let delete = Operation::delete_track(user(), &"t1".into());
        apply_operation(&mut state, &delete).unwrap();
        assert!(state.track(&"t1".into()).is_none());
    }

    #[test]
    fn unknown_combination_is_noop() {
        let state = base();
        let op = Operation::new(
            OperationType::Modify,
            user(),
            OperationTarget {
                kind: TargetType::Keyframe,
                id: "k1".to_string(),
            },
            json!({ "value": 3 }),
        );
        assert_eq!(reduce(&state, &op).unwrap(), state);
    }

    #[test]
    fn malformed_payload_fails_without_change() {
        let mut state = base();
        let before = state.clone();
        let mut op = Operation::insert_clip(user(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));
        op.payload = json!({ "trackId": "t1" });

        let err = apply_operation(&mut state, &op).unwrap_err();
        assert!(matches!(err, CollaborationError::InvalidOp(_)));
        assert_eq!(state, before);
    }

    #[test]
    fn delete_of_missing_clip_is_an_error() {
        let state = base();
        let op = Operation::delete_clip(user(), &"ghost".into());
        assert!(reduce(&state, &op).is_err());
    }
}
