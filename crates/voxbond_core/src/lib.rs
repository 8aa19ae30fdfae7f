//! # VOXBOND Core
//!
//! Connectivity groups over a parallel voxel lattice:
//! - rigidly linked voxels share one group and one integer coordinate frame
//! - a group is rebuilt lazily by breadth-first traversal when its links change
//! - new cross-group links are admitted only when the two frames do not overlap
//! - joined groups are merged, broken groups are split
//!
//! ## Architecture Rules
//!
//! 1. **No worker ever blocks** - every lock is a bounded try-lock; contention
//!    means "retry next step"
//! 2. **Handles, not pointers** - voxels and groups live in [`Lattice`]
//!    storage and are addressed by [`VoxelId`] / [`GroupId`]
//! 3. **Explicit context** - every operation receives the [`Lattice`]
//! 4. **One lock order** - rebuild locks before check locks, ascending id
//!
//! ## Example
//!
//! ```rust
//! use voxbond_core::{GroupConfig, Lattice, LinkDirection, VoxelId};
//!
//! let lattice = Lattice::new(2, GroupConfig::default());
//! let (a, b) = (VoxelId::new(0), VoxelId::new(1));
//!
//! assert!(lattice.try_attach(a, b, LinkDirection::PosX).unwrap().is_attached());
//! lattice.rebuild(a).unwrap();
//!
//! let layout = lattice.snapshot(lattice.group_of(a).unwrap().id()).unwrap();
//! assert_eq!(layout.dims(), [2, 1, 1]);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod group;
pub mod lattice;
pub mod sync;

pub use config::GroupConfig;
pub use error::{GroupError, GroupResult};
pub use group::{
    AttachOutcome, AuditReport, AuditViolation, CheckOutcome, CoordMapper, DeferReason,
    GridCoord, Group, GroupId, GroupLayout, GroupState, Incompatibility, LinkPair, MergeOutcome,
    MergeReport, RebuildOutcome, RebuildReport, RebuildStats, SkipReason,
};
pub use lattice::{Lattice, LatticeBuilder, LinkDirection, Voxel, VoxelId};
pub use sync::{SpinFlag, SpinGuard, SpinStats};
