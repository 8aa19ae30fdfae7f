//! # Synchronization Primitives for Parallel Group Maintenance
//!
//! ORDER OF THE DAY: No worker ever blocks. Every lock is a try-lock.
//!
//! ## The Problem
//!
//! ```text
//! Worker 17 (voxel 17):  link formed   -> rebuild group 3
//! Worker 42 (voxel 42):  link formed   -> rebuild group 3   (same group!)
//! Worker 99 (voxel 99):  attach probe  -> read group 3 map  (mid-rebuild!)
//!
//! Blocking mutex:  one hot group stalls the whole lattice step
//! No lock:         torn maps, duplicated members
//! ```
//!
//! ## The Solution: Try-Acquire, Defer on Contention
//!
//! ```text
//! acquire?  ── yes ──> do the work, release on drop
//!    │
//!    no ───────────> return "not now"; the dirty flag survives to the next step
//! ```
//!
//! Bounded spinning (`lock_spin_limit` attempts) absorbs short critical
//! sections without ever turning into a wait.

mod spin;

pub use spin::{spin_until, SpinFlag, SpinGuard, SpinStats};
