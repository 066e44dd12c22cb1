use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Formatted type as reported by `format_type`, e.g. `character
    /// varying(20)`. Compared textually; never parsed.
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub ordinal: i16,
}

impl ColumnSchema {
    /// Sequence-backed defaults are skipped when mirroring a shape: the
    /// destination generates its own identity values, if any.
    pub fn has_sequence_default(&self) -> bool {
        self.default
            .as_deref()
            .is_some_and(|d| d.starts_with("nextval("))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    Default,
    Full,
    Nothing,
    Index,
}

impl ReplicaIdentity {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'd' => Some(ReplicaIdentity::Default),
            'f' => Some(ReplicaIdentity::Full),
            'n' => Some(ReplicaIdentity::Nothing),
            'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub replica_identity: ReplicaIdentity,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// The shape with the given columns removed, used to honor
    /// per-mapping column exclusions.
    pub fn without_columns(&self, excluded: &[String]) -> TableSchema {
        let mut shape = self.clone();
        shape.columns.retain(|c| !excluded.contains(&c.name));
        shape.primary_key.retain(|c| !excluded.contains(c));
        shape
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    /// Full `CREATE [UNIQUE] INDEX ...` statement from `pg_get_indexdef`,
    /// replicated verbatim.
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Access method, e.g. `btree`.
    pub index_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub constraint_name: String,
    /// Table the constraint is declared on.
    pub table_schema: String,
    pub table_name: String,
    /// Table the constraint points at.
    pub referenced_schema: String,
    pub referenced_table: String,
    /// Full definition from `pg_get_constraintdef`.
    pub definition: String,
    pub on_delete: String,
    pub on_update: String,
    pub is_deferrable: bool,
    pub initially_deferred: bool,
}

impl ForeignKeyDef {
    pub fn table_ref(&self) -> String {
        format!("{}.{}", self.table_schema, self.table_name)
    }
}
