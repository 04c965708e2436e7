use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;

/// Deferred jobs raised while scavenging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkKind {
    /// Babble or port activity: the root hub should re-read its ports.
    RootHubStatusChange,
    /// Controller parts that wedge after babble need a full reset.
    ResetAfterBabble,
    /// Host system or process error reported in USBSTS.
    ControllerError,
}

const KINDS: usize = 3;

impl WorkKind {
    fn index(self) -> usize {
        match self {
            WorkKind::RootHubStatusChange => 0,
            WorkKind::ResetAfterBabble => 1,
            WorkKind::ControllerError => 2,
        }
    }
}

/// Work queue holding at most one queued or running instance per kind.
pub struct WorkQueue {
    queue: SegQueue<WorkKind>,
    busy: [AtomicBool; KINDS],
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            busy: [const { AtomicBool::new(false) }; KINDS],
        }
    }

    /// Queue `kind` unless an instance is already pending or running.
    pub fn submit(&self, kind: WorkKind) -> bool {
        if self.busy[kind.index()].swap(true, Ordering::AcqRel) {
            trace!("work {kind:?} already in flight");
            return false;
        }
        self.queue.push(kind);
        true
    }

    /// Take the next job. The kind stays busy until [`WorkQueue::finish`].
    pub fn take(&self) -> Option<WorkKind> {
        self.queue.pop()
    }

    pub fn finish(&self, kind: WorkKind) {
        self.busy[kind.index()].store(false, Ordering::Release);
    }

    pub fn is_pending(&self, kind: WorkKind) -> bool {
        self.busy[kind.index()].load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
