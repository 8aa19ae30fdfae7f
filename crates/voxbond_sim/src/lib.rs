//! # VOXBOND Simulation Context
//!
//! The owning context around [`voxbond_core`]: it queues link changes coming
//! from the physics side and runs group bookkeeping once per step, with one
//! logical worker per voxel fanned out over OS threads.
//!
//! ## Example
//!
//! ```rust
//! use voxbond_core::{Lattice, LinkDirection, VoxelId};
//! use voxbond_sim::{LinkEvent, SimConfig, StepDriver};
//!
//! let config = SimConfig::default();
//! let lattice = Lattice::new(2, config.groups.clone());
//! let mut driver = StepDriver::new(lattice, config);
//!
//! driver.submit(LinkEvent::Attach {
//!     host: VoxelId::new(0),
//!     remote: VoxelId::new(1),
//!     direction: LinkDirection::PosX,
//! });
//! let report = driver.run(2).unwrap();
//! assert_eq!(report.attaches, 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod events;
pub mod step;

pub use config::SimConfig;
pub use error::{SimError, SimResult};
pub use events::{EventQueue, LinkEvent, QueuedEvent};
pub use step::{StepDriver, StepReport};
