//! Object pooling subsystem.
//!
//! # Data Flow
//! ```text
//! pipe write needs space
//!     → segment.rs (SegmentPool::rent, reuse or allocate)
//!     → bytes copied into the segment, segment linked into the pipe
//!
//! pipe advance consumes a segment
//!     → segment retired until no read view references it
//!     → object_pool.rs (give_back: store if under capacity, else discard)
//! ```
//!
//! # Design Decisions
//! - One generic pool type; segments are just one `Poolable` instance type
//! - The "currently pooled" marker lives on the instance, so a second return
//!   is detected no matter which handle it comes from

pub mod object_pool;
pub mod segment;

pub use object_pool::{ObjectPool, PoolError, PoolStats, Poolable, Pooled, ReturnOutcome};
pub use segment::{Segment, SegmentPool};
