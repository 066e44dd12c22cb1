//! Snapshot engine: pins a consistent snapshot of the source, partitions
//! each table by hash-of-key, and copies partitions in bounded parallelism.

mod copy;
mod engine;
mod partition;
mod session;

pub use copy::copy_table;
pub use engine::run_snapshot;
pub use partition::{
    copy_out_query,
    partition_count,
    PartitionSpec,
};
pub use session::{
    SessionHandle,
    SnapshotSessionRegistry,
};
