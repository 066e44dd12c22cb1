use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};

use crate::lsn::Lsn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A decoded row-level change pulled from the source WAL.
///
/// Values are the Postgres text representations produced by the pgoutput
/// plugin; `None` is SQL NULL. A column that is *absent* from a value map was
/// an unchanged TOAST datum, which carries no logical value -- appliers must
/// not overwrite it with NULL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    pub schema: String,
    pub table: String,
    pub lsn: Lsn,
    pub column_names: Vec<String>,
    /// Present for INSERT and UPDATE.
    pub new_values: BTreeMap<String, Option<String>>,
    /// Present for DELETE always, and for UPDATE when the replica identity is
    /// FULL or a key column changed.
    pub old_values: Option<BTreeMap<String, Option<String>>>,
    pub commit_time: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    /// The `schema.table` key used for per-table bookkeeping.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}
