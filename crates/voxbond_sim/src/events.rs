//! # Link Events
//!
//! Link changes requested by the physics side, queued between steps.
//!
//! ```text
//! physics thread(s) ──submit──> EventQueue ──drain──> StepDriver::step
//!                                   ^                       │
//!                                   └──── requeue ──────────┘  (deferred attaches)
//! ```

use crossbeam_channel::{Receiver, Sender};
use voxbond_core::{LinkDirection, VoxelId};

/// A requested link change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Form a link from `host` to `remote` along `direction`.
    Attach {
        /// Voxel whose slot `direction` receives the link.
        host: VoxelId,
        /// Voxel on the other end.
        remote: VoxelId,
        /// Direction from host to remote.
        direction: LinkDirection,
    },
    /// Break the link in slot `direction` of `voxel`.
    Break {
        /// Voxel whose slot is cleared.
        voxel: VoxelId,
        /// Slot to clear.
        direction: LinkDirection,
    },
}

impl LinkEvent {
    /// The voxel whose worker handles this event.
    #[inline]
    #[must_use]
    pub const fn voxel(&self) -> VoxelId {
        match self {
            Self::Attach { host, .. } => *host,
            Self::Break { voxel, .. } => *voxel,
        }
    }
}

/// An event and the number of steps it has been attempted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedEvent {
    /// The request.
    pub event: LinkEvent,
    /// Previous attempts.
    pub attempts: u32,
}

/// Multi-producer queue of link events.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<QueuedEvent>,
    rx: Receiver<QueuedEvent>,
}

impl EventQueue {
    /// Creates an empty, unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Submits a fresh event.
    pub fn submit(&self, event: LinkEvent) {
        self.requeue(QueuedEvent { event, attempts: 0 });
    }

    /// Puts an event back for a later step.
    pub fn requeue(&self, queued: QueuedEvent) {
        // Both ends live in `self`; the channel cannot be disconnected
        let _ = self.tx.send(queued);
    }

    /// Events waiting.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns whether nothing is waiting.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Takes every event queued so far.
    ///
    /// Events submitted while draining may land in this batch or the next.
    #[must_use]
    pub fn drain(&self) -> Vec<QueuedEvent> {
        let waiting = self.rx.len();
        self.rx.try_iter().take(waiting).collect()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
