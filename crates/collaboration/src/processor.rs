/// Sequential operation processing for one project
/// The only place the live timeline is mutated
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use timeline::TimelineState;
use tracing::{debug, error, warn};

use crate::{
    reducer, CollabEvent, ConflictDetector, ConflictResolver, DetectorConfig, EventBus, LogEntry,
    Operation, OperationId, OperationLog,
};

/// Outcome of one [`OperationProcessor::drain`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub deferred: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub conflicts: usize,

    /// Another drain was already running; nothing was done
    pub skipped: bool,
}

struct ProcessorState {
    log: OperationLog,
    detector: ConflictDetector,
    timeline: Arc<TimelineState>,
}

pub struct OperationProcessor {
    queue: Mutex<VecDeque<Operation>>,
    state: Mutex<ProcessorState>,
    is_processing: AtomicBool,
    resolver: Arc<ConflictResolver>,
    events: Arc<EventBus>,
}

/// Clears the processing flag when the drain ends, even on panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OperationProcessor {
    pub fn new(
        timeline: TimelineState,
        config: DetectorConfig,
        resolver: Arc<ConflictResolver>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(ProcessorState {
                log: OperationLog::new(),
                detector: ConflictDetector::new(config),
                timeline: Arc::new(timeline),
            }),
            is_processing: AtomicBool::new(false),
            resolver,
            events,
        }
    }

    /// Queues an operation. Never rejects; duplicates are filtered at drain time.
    pub fn enqueue(&self, op: Operation) {
        self.queue.lock().push_back(op);
    }

    /// Processes the queue until no further operation can be applied.
    pub fn drain(&self) -> DrainReport {
        let Some(_guard) = DrainGuard::acquire(&self.is_processing) else {
            return DrainReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut report = DrainReport::default();
        let mut batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return report;
        }

        let mut state = self.state.lock();
        let ProcessorState {
            log,
            detector,
            timeline,
        } = &mut *state;

        for op in &batch {
            log.record(op.clone());
        }

        for conflict in detector.scan(log) {
            report.conflicts += 1;
            self.resolver.register(conflict.clone());
            self.events.emit(CollabEvent::ConflictDetected { conflict });
        }

        loop {
            let mut progressed = false;
            let mut waiting: VecDeque<Operation> = VecDeque::new();

            while let Some(op) = batch.pop_front() {
                if log.is_applied(&op.id) || waiting.iter().any(|w| w.id == op.id) {
                    report.duplicates += 1;
                    continue;
                }

                if !log.unsatisfied_dependencies(&op).is_empty() {
                    waiting.push_back(op);
                    continue;
                }

                match reducer::apply_operation(Arc::make_mut(timeline), &op) {
                    Ok(()) => {
                        log.mark_applied(&op.id);
                        report.applied += 1;
                        progressed = true;
                        debug!(operation = %op.id, user = %op.user_id, "applied {:?} on {}", op.op_type, op.target.id);
                        self.events.emit(CollabEvent::TimelineUpdated { operation: op });
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(operation = %op.id, "operation_failed: {}", e);
                        self.events.emit(CollabEvent::OperationFailed {
                            operation_id: op.id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            batch = waiting;
            if !progressed || batch.is_empty() {
                break;
            }
        }

        for op in &batch {
            let missing = log.unsatisfied_dependencies(op);
            warn!(operation = %op.id, ?missing, "deferring operation with unapplied dependencies");
            self.events.emit(CollabEvent::OperationDeferred {
                operation_id: op.id.clone(),
                missing,
            });
        }
        report.deferred = batch.len();
        drop(state);

        // Deferred operations go back ahead of anything enqueued meanwhile
        let mut queue = self.queue.lock();
        for op in batch.into_iter().rev() {
            queue.push_front(op);
        }

        report
    }

    /// Read-only snapshot of the live timeline.
    pub fn timeline(&self) -> Arc<TimelineState> {
        self.state.lock().timeline.clone()
    }

    /// Replaces the timeline and log wholesale, e.g. after loading a project.
    /// Entries that were never applied are queued again.
    pub fn restore(&self, timeline: TimelineState, entries: Vec<LogEntry>) {
        let pending: Vec<Operation> = entries
            .iter()
            .filter(|e| !e.applied)
            .map(|e| e.operation.clone())
            .collect();

        let mut state = self.state.lock();
        state.log = OperationLog::from_entries(entries);
        state.detector.reset();
        state.timeline = Arc::new(timeline);
        drop(state);

        let mut queue = self.queue.lock();
        queue.clear();
        queue.extend(pending);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.history()
    }

    /// Applied operations in application order, used to seed late joiners.
    pub fn applied_operations(&self) -> Vec<Operation> {
        self.state.lock().log.applied().cloned().collect()
    }

    pub fn is_applied(&self, id: &OperationId) -> bool {
        self.state.lock().log.is_applied(id)
    }

    pub fn last_touching(&self, target_id: &str) -> Option<OperationId> {
        self.state.lock().log.last_touching(target_id).cloned()
    }

    pub fn operation_count(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn applied_count(&self) -> usize {
        self.state.lock().log.applied_count()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConflictType;
    use timeline::{Clip, Track, TrackKind};

    fn processor() -> (OperationProcessor, Arc<ConflictResolver>, Arc<EventBus>) {
        let mut timeline = TimelineState::default();
        timeline.tracks.push(Track::new("t1", TrackKind::Video, 0));
        let resolver = Arc::new(ConflictResolver::new());
        let events = Arc::new(EventBus::new());
        let processor = OperationProcessor::new(
            timeline,
            DetectorConfig::default(),
            resolver.clone(),
            events.clone(),
        );
        (processor, resolver, events)
    }

    #[test]
    fn same_operation_applies_once() {
        let (processor, _, _) = processor();
        let op = Operation::insert_clip("u1".into(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));

        processor.enqueue(op.clone());
        processor.enqueue(op.clone());
        let report = processor.drain();
        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicates, 1);

        processor.enqueue(op);
        let report = processor.drain();
        assert_eq!(report.applied, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(processor.timeline().clip_count(), 1);
    }

    #[test]
    fn dependency_waits_for_its_parent() {
        let (processor, _, events) = processor();
        let mut rx = events.subscribe();

        let insert = Operation::insert_clip("u1".into(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));
        let delete = Operation::delete_clip("u1".into(), &"c1".into())
            .with_dependencies(vec![insert.id.clone()]);

        processor.enqueue(delete.clone());
        let report = processor.drain();
        assert_eq!(report.deferred, 1);
        assert_eq!(processor.queued_len(), 1);
        assert!(!processor.is_applied(&delete.id));
        assert!(matches!(rx.try_recv(), Ok(CollabEvent::OperationDeferred { .. })));

        processor.enqueue(insert.clone());
        let report = processor.drain();
        assert_eq!(report.applied, 2);
        assert_eq!(processor.queued_len(), 0);
        assert_eq!(processor.timeline().clip_count(), 0);
    }

    #[test]
    fn failure_does_not_stop_the_drain() {
        let (processor, _, events) = processor();
        let mut rx = events.subscribe();

        processor.enqueue(Operation::delete_clip("u1".into(), &"ghost".into()));
        processor.enqueue(Operation::insert_clip(
            "u1".into(),
            "t1".into(),
            Clip::new("c1", "a1", 0.0, 5.0),
        ));

        let report = processor.drain();
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(processor.queued_len(), 0);
        assert!(matches!(rx.try_recv(), Ok(CollabEvent::OperationFailed { .. })));
        assert!(matches!(rx.try_recv(), Ok(CollabEvent::TimelineUpdated { .. })));
    }

    #[test]
    fn overlapping_inserts_register_one_conflict() {
        let (processor, resolver, _) = processor();

        processor.enqueue(Operation::insert_clip(
            "u1".into(),
            "t1".into(),
            Clip::new("c1", "a1", 0.0, 5.0),
        ));
        processor.drain();
        processor.enqueue(Operation::insert_clip(
            "u2".into(),
            "t1".into(),
            Clip::new("c2", "a1", 3.0, 8.0),
        ));
        let report = processor.drain();

        assert_eq!(report.conflicts, 1);
        let conflicts = resolver.open_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ClipOverlap);

        // detection is advisory; both clips stay on the track
        assert_eq!(processor.timeline().clip_count(), 2);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_drains() {
        let (processor, _, _) = processor();
        let before = processor.timeline();

        processor.enqueue(Operation::insert_clip(
            "u1".into(),
            "t1".into(),
            Clip::new("c1", "a1", 0.0, 5.0),
        ));
        processor.drain();

        assert_eq!(before.clip_count(), 0);
        assert_eq!(processor.timeline().clip_count(), 1);
    }

    #[test]
    fn guard_blocks_reentry() {
        let flag = AtomicBool::new(false);
        let guard = DrainGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(DrainGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(DrainGuard::acquire(&flag).is_some());
    }

    #[test]
    fn restore_requeues_unapplied_entries() {
        let (processor, _, _) = processor();
        let parent = Operation::insert_clip("u1".into(), "t1".into(), Clip::new("c1", "a1", 0.0, 5.0));
        let child = Operation::delete_clip("u1".into(), &"c1".into())
            .with_dependencies(vec![parent.id.clone()]);

        processor.restore(
            TimelineState::default(),
            vec![LogEntry {
                operation: child,
                applied: false,
            }],
        );
        assert_eq!(processor.queued_len(), 1);
        assert_eq!(processor.timeline().tracks.len(), 0);
        assert_eq!(processor.operation_count(), 1);
    }
}
