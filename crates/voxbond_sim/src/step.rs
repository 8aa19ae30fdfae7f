//! # Step Driver
//!
//! One simulation step of group bookkeeping:
//!
//! ```text
//! drain queue ──> bucket events by voxel
//!                      │
//!       ┌──────────────┼──────────────┐        worker_threads scoped threads,
//!   voxels 0..k    voxels k..2k    voxels 2k..n    one logical worker per voxel:
//!       │              │              │              1. breaks
//!       │              │              │              2. attaches (requeue on deferral)
//!       │              │              │              3. rebuild own group if dirty
//!       └──────────────┼──────────────┘
//!                      │
//!   first fatal error? ──yes──> SimError::Fatal
//!                      │
//!               reclaim merged groups ──> StepReport
//! ```
//!
//! Workers never wait for each other: every contended operation defers to
//! the next step through the group's dirty flag or the event queue.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use voxbond_core::{AttachOutcome, GroupError, GroupResult, Lattice, RebuildOutcome, VoxelId};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::events::{EventQueue, LinkEvent, QueuedEvent};

/// Counters for one step (or, from [`StepDriver::run`], a whole run).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Steps covered.
    pub steps: u64,
    /// Rebuilds performed.
    pub rebuilds: u64,
    /// Rebuild requests that lost a lock race.
    pub contended: u64,
    /// Links formed.
    pub attaches: u64,
    /// Attaches that merged two groups.
    pub merges: u64,
    /// Attach attempts deferred.
    pub deferrals: u64,
    /// Attach attempts rejected as incompatible.
    pub rejections: u64,
    /// Attach requests dropped after `attach_retry_limit` attempts.
    pub abandoned: u64,
    /// Links broken.
    pub breaks: u64,
    /// Groups split by a rebuild.
    pub splits: u64,
    /// Merged group slots returned to the free pool.
    pub reclaimed: u64,
    /// Events dropped for naming a voxel or group outside the lattice.
    pub dropped: u64,
    /// Wall time.
    pub duration: Duration,
}

impl StepReport {
    /// Adds `other` into `self`.
    pub fn absorb(&mut self, other: &Self) {
        self.steps += other.steps;
        self.rebuilds += other.rebuilds;
        self.contended += other.contended;
        self.attaches += other.attaches;
        self.merges += other.merges;
        self.deferrals += other.deferrals;
        self.rejections += other.rejections;
        self.abandoned += other.abandoned;
        self.breaks += other.breaks;
        self.splits += other.splits;
        self.reclaimed += other.reclaimed;
        self.dropped += other.dropped;
        self.duration += other.duration;
    }
}

/// Owns the lattice and drives it step by step.
#[derive(Debug)]
pub struct StepDriver {
    lattice: Lattice,
    config: SimConfig,
    queue: EventQueue,
    step: u64,
}

impl StepDriver {
    /// Creates a driver. The lattice should have been built with
    /// `config.groups`.
    #[must_use]
    pub fn new(lattice: Lattice, config: SimConfig) -> Self {
        Self {
            lattice,
            config,
            queue: EventQueue::new(),
            step: 0,
        }
    }

    /// The lattice.
    #[inline]
    #[must_use]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// The event queue; clone it to submit from other threads.
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Steps completed.
    #[inline]
    #[must_use]
    pub fn steps_completed(&self) -> u64 {
        self.step
    }

    /// Queues a link event for the next step.
    pub fn submit(&self, event: LinkEvent) {
        self.queue.submit(event);
    }

    /// Consumes the driver, returning the lattice.
    #[must_use]
    pub fn into_lattice(self) -> Lattice {
        self.lattice
    }

    /// Runs one step.
    ///
    /// # Errors
    ///
    /// [`SimError::Fatal`] with the first fatal group error any worker hit;
    /// [`SimError::WorkerPanicked`] if a worker thread panicked.
    pub fn step(&mut self) -> SimResult<StepReport> {
        let span = tracing::info_span!("step", step = self.step);
        let _enter = span.enter();
        let started = Instant::now();

        let voxel_count = self.lattice.voxel_count();
        let mut report = StepReport {
            steps: 1,
            ..StepReport::default()
        };

        let mut buckets: Vec<Vec<QueuedEvent>> = (0..voxel_count).map(|_| Vec::new()).collect();
        for queued in self.queue.drain() {
            let remote_known = match queued.event {
                LinkEvent::Attach { remote, .. } => remote.index() < voxel_count,
                LinkEvent::Break { .. } => true,
            };
            match buckets.get_mut(queued.event.voxel().index()) {
                Some(bucket) if remote_known => bucket.push(queued),
                _ => {
                    tracing::warn!(event = ?queued.event, "event for unknown voxel dropped");
                    report.dropped += 1;
                }
            }
        }

        let threads = self.config.worker_threads.clamp(1, voxel_count.max(1));
        let chunk = voxel_count.div_ceil(threads).max(1);
        let (fatal_tx, fatal_rx) = crossbeam_channel::unbounded();
        let worker = Worker {
            lattice: &self.lattice,
            queue: &self.queue,
            retry_limit: self.config.attach_retry_limit,
            fatal: fatal_tx,
        };

        let tallies: Vec<thread::Result<StepReport>> = thread::scope(|s| {
            let handles: Vec<_> = buckets
                .chunks(chunk)
                .enumerate()
                .map(|(i, range)| {
                    let worker = worker.clone();
                    s.spawn(move || worker.run(i * chunk, range))
                })
                .collect();
            handles.into_iter().map(|h| h.join()).collect()
        });
        drop(worker);

        for (i, tally) in tallies.into_iter().enumerate() {
            let tally = tally.map_err(|_| SimError::WorkerPanicked(i))?;
            report.absorb(&tally);
        }
        if let Some(err) = fatal_rx.try_iter().next() {
            tracing::error!(error = %err, "step failed");
            return Err(SimError::Fatal(err));
        }

        report.reclaimed = self.lattice.reclaim_merged() as u64;
        report.duration = started.elapsed();
        self.step += 1;
        tracing::debug!(
            rebuilds = report.rebuilds,
            attaches = report.attaches,
            breaks = report.breaks,
            deferrals = report.deferrals,
            "step complete"
        );
        Ok(report)
    }

    /// Runs `steps` steps, stopping at the first error.
    ///
    /// Returns the summed report.
    ///
    /// # Errors
    ///
    /// The first error of [`StepDriver::step`].
    pub fn run(&mut self, steps: u64) -> SimResult<StepReport> {
        let mut total = StepReport::default();
        for _ in 0..steps {
            let report = self.step()?;
            total.absorb(&report);
        }
        Ok(total)
    }
}

/// Per-thread view of the step.
#[derive(Clone)]
struct Worker<'a> {
    lattice: &'a Lattice,
    queue: &'a EventQueue,
    retry_limit: u32,
    fatal: Sender<GroupError>,
}

impl Worker<'_> {
    /// Services the voxels `base..base + buckets.len()`.
    fn run(&self, base: usize, buckets: &[Vec<QueuedEvent>]) -> StepReport {
        let mut tally = StepReport::default();
        for (offset, events) in buckets.iter().enumerate() {
            let voxel = VoxelId::new((base + offset) as u32);
            if let Err(err) = self.service(voxel, events, &mut tally) {
                if err.is_fatal() {
                    // Receiver outlives every worker
                    let _ = self.fatal.send(err);
                    break;
                }
                tracing::warn!(%voxel, error = %err, "voxel skipped");
            }
        }
        tally
    }

    fn service(
        &self,
        voxel: VoxelId,
        events: &[QueuedEvent],
        tally: &mut StepReport,
    ) -> GroupResult<()> {
        for queued in events {
            if let LinkEvent::Break { voxel, direction } = queued.event {
                match self.lattice.unlink(voxel, direction) {
                    Ok(Some(_)) => tally.breaks += 1,
                    Ok(None) => {}
                    Err(err) => Self::drop_event(queued, err, tally)?,
                }
            }
        }

        for queued in events {
            let LinkEvent::Attach {
                host,
                remote,
                direction,
            } = queued.event
            else {
                continue;
            };
            let outcome = match self.lattice.try_attach(host, remote, direction) {
                Ok(outcome) => outcome,
                Err(err) => {
                    Self::drop_event(queued, err, tally)?;
                    continue;
                }
            };
            match outcome {
                AttachOutcome::Attached { merged, .. } => {
                    tally.attaches += 1;
                    if merged.is_some() {
                        tally.merges += 1;
                    }
                }
                AttachOutcome::Deferred(reason) => {
                    tally.deferrals += 1;
                    tracing::trace!(%host, %remote, %reason, "attach deferred");
                    self.retry(*queued, tally);
                }
                AttachOutcome::Incompatible(why) => {
                    tally.rejections += 1;
                    tracing::trace!(%host, %remote, %why, "attach rejected");
                    self.retry(*queued, tally);
                }
            }
        }

        if self.lattice.group_of(voxel)?.needs_rebuild() {
            match self.lattice.rebuild(voxel)? {
                RebuildOutcome::Rebuilt(report) => {
                    tally.rebuilds += 1;
                    if report.split_off.is_some() {
                        tally.splits += 1;
                    }
                }
                RebuildOutcome::Contended => tally.contended += 1,
                RebuildOutcome::Skipped(_) => {}
            }
        }
        Ok(())
    }

    /// Drops an event that hit a non-fatal error; fatal errors propagate.
    fn drop_event(
        queued: &QueuedEvent,
        err: GroupError,
        tally: &mut StepReport,
    ) -> GroupResult<()> {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(event = ?queued.event, error = %err, "event dropped");
        tally.dropped += 1;
        Ok(())
    }

    fn retry(&self, queued: QueuedEvent, tally: &mut StepReport) {
        let attempts = queued.attempts + 1;
        if attempts < self.retry_limit {
            self.queue.requeue(QueuedEvent { attempts, ..queued });
        } else {
            tally.abandoned += 1;
            tracing::debug!(event = ?queued.event, attempts, "attach abandoned");
        }
    }
}
