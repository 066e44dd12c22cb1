//! Source adapter: connections to the replicated-from database, publication
//! and replication-slot lifecycle, snapshot export, and the WAL decoding
//! stream.

mod connection;
mod naming;
mod publication;
mod slot;
mod stream;
pub mod wal;

pub use connection::{
    connect,
    connect_replication,
    simple_query_opt,
    ReplicationClient,
    SourceConnection,
};
pub use naming::{
    publication_name,
    slot_name,
};
pub use publication::{
    create_publication,
    drop_publication,
    publication_exists,
};
pub use slot::{
    approx_row_count,
    create_slot_with_snapshot,
    drop_slot,
    export_snapshot,
    get_table_oid,
    server_version_num,
    slot_exists,
    CreatedSlot,
};
pub use stream::{
    Batch,
    WalStream,
};
