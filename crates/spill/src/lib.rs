//! Single-stream disk spilling.
//!
//! Architecture role:
//! - chooses spill directories and creates one file per spiller
//! - appends encoded batches on a bounded blocking-I/O pool
//! - replays spilled batches lazily in write order
//! - charges memory and spill space, and returns both on close
//!
//! Key modules:
//! - [`factory`]
//! - [`spiller`]
//! - [`context`]
//! - [`executor`]
//! - [`paths`]

pub mod context;
pub mod executor;
pub mod factory;
pub mod layout;
pub mod paths;
pub mod reader;
pub mod spiller;
pub mod writer;

pub use context::{LocalSpillContext, QuerySpillContext, SpillContext, SpillSpaceTracker};
pub use executor::{SpillExecutor, SpillFuture, SpillHandle};
pub use factory::{FileSingleStreamSpillerFactory, SingleStreamSpillerFactory};
pub use layout::BUFFER_SIZE;
pub use paths::{DiskUsage, FsDiskUsage, SpillPathSelector};
pub use reader::SpilledPages;
pub use spiller::{FileSingleStreamSpiller, SingleStreamSpiller};
