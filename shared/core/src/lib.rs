//! Shared primitives for the distributed distance engine: process-group-
//! agnostic partition arithmetic, the scalar dtype lattice, plateau
//! detection, reduced-precision reduction kernels, the bounded send-record
//! slot, and the error type every other crate in the workspace returns.

pub mod bounded_queue;
pub mod dtype;
pub mod error;
pub mod partition;
pub mod plateau;
pub mod reduce_ops;
pub mod running_average;
pub mod send_record;

pub use dtype::{Family, ScalarKind};
pub use error::{Error, Result};
pub use partition::Partition;
pub use plateau::PlateauDetector;
pub use send_record::SendRecordSlot;
