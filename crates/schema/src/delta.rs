use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};

use crate::types::{
    ColumnSchema,
    ForeignKeyDef,
    IndexDef,
    TableSchema,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub column: String,
    pub source_type: String,
    pub destination_type: String,
}

/// The difference between a source table shape and its destination
/// counterpart. Only `added_columns`, `added_indexes`, and `added_fks` are
/// ever applied automatically; the rest is reported for the operator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDelta {
    pub added_columns: Vec<ColumnSchema>,
    pub dropped_columns: Vec<String>,
    pub type_changes: Vec<TypeChange>,
    pub added_indexes: Vec<IndexDef>,
    pub dropped_indexes: Vec<String>,
    pub added_fks: Vec<ForeignKeyDef>,
    pub dropped_fks: Vec<String>,
}

impl SchemaDelta {
    pub fn is_empty(&self) -> bool {
        self == &SchemaDelta::default()
    }

    /// Whether anything changed that the engine will not apply on its own.
    pub fn has_manual_changes(&self) -> bool {
        !self.dropped_columns.is_empty()
            || !self.type_changes.is_empty()
            || !self.dropped_indexes.is_empty()
            || !self.dropped_fks.is_empty()
    }
}

/// Compares the two sides of one table mapping. Type comparison is textual
/// on the formatted type; a mismatch is reported, never auto-applied.
pub fn compare(
    source: &TableSchema,
    destination: &TableSchema,
    source_indexes: &[IndexDef],
    destination_indexes: &[IndexDef],
    source_fks: &[ForeignKeyDef],
    destination_fks: &[ForeignKeyDef],
) -> SchemaDelta {
    let mut delta = SchemaDelta::default();

    for column in &source.columns {
        match destination.column(&column.name) {
            None => delta.added_columns.push(column.clone()),
            Some(dest_column) if dest_column.data_type != column.data_type => {
                delta.type_changes.push(TypeChange {
                    column: column.name.clone(),
                    source_type: column.data_type.clone(),
                    destination_type: dest_column.data_type.clone(),
                });
            },
            Some(_) => {},
        }
    }
    delta.dropped_columns = destination
        .columns
        .iter()
        .filter(|c| source.column(&c.name).is_none())
        .map(|c| c.name.clone())
        .collect();

    // Primary-key indexes ride along with the table shape, not the index
    // delta.
    let src_index_names: Vec<&str> = source_indexes
        .iter()
        .filter(|i| !i.is_primary)
        .map(|i| i.name.as_str())
        .collect();
    delta.added_indexes = source_indexes
        .iter()
        .filter(|i| !i.is_primary)
        .filter(|i| !destination_indexes.iter().any(|d| d.name == i.name))
        .cloned()
        .collect();
    delta.dropped_indexes = destination_indexes
        .iter()
        .filter(|i| !i.is_primary)
        .filter(|i| !src_index_names.contains(&i.name.as_str()))
        .map(|i| i.name.clone())
        .collect();

    delta.added_fks = source_fks
        .iter()
        .filter(|f| {
            !destination_fks
                .iter()
                .any(|d| d.constraint_name == f.constraint_name)
        })
        .cloned()
        .collect();
    delta.dropped_fks = destination_fks
        .iter()
        .filter(|f| {
            !source_fks
                .iter()
                .any(|s| s.constraint_name == f.constraint_name)
        })
        .map(|f| f.constraint_name.clone())
        .unique()
        .collect();

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaIdentity;

    fn column(name: &str, data_type: &str) -> ColumnSchema {
        ColumnSchema {
            name: name.to_owned(),
            data_type: data_type.to_owned(),
            nullable: true,
            default: None,
            ordinal: 0,
        }
    }

    fn table(columns: Vec<ColumnSchema>) -> TableSchema {
        TableSchema {
            schema: "public".to_owned(),
            name: "accounts".to_owned(),
            columns,
            primary_key: vec!["id".to_owned()],
            replica_identity: ReplicaIdentity::Default,
        }
    }

    fn index(name: &str, is_primary: bool) -> IndexDef {
        IndexDef {
            schema: "public".to_owned(),
            table: "accounts".to_owned(),
            name: name.to_owned(),
            definition: format!("CREATE INDEX {name} ON public.accounts USING btree (id)"),
            is_unique: false,
            is_primary,
            index_type: "btree".to_owned(),
        }
    }

    #[test]
    fn identical_shapes_produce_empty_delta() {
        let src = table(vec![column("id", "integer"), column("bal", "integer")]);
        let delta = compare(&src, &src, &[], &[], &[], &[]);
        assert!(delta.is_empty());
        assert!(!delta.has_manual_changes());
    }

    #[test]
    fn added_column_is_applied_dropped_is_reported() {
        let src = table(vec![
            column("id", "integer"),
            column("bal", "integer"),
            column("note", "text"),
        ]);
        let dst = table(vec![
            column("id", "integer"),
            column("bal", "integer"),
            column("legacy", "text"),
        ]);
        let delta = compare(&src, &dst, &[], &[], &[], &[]);
        assert_eq!(delta.added_columns, vec![column("note", "text")]);
        assert_eq!(delta.dropped_columns, vec!["legacy".to_owned()]);
        assert!(delta.has_manual_changes());
    }

    #[test]
    fn type_mismatch_is_reported_not_applied() {
        let src = table(vec![column("id", "bigint")]);
        let dst = table(vec![column("id", "integer")]);
        let delta = compare(&src, &dst, &[], &[], &[], &[]);
        assert!(delta.added_columns.is_empty());
        assert_eq!(
            delta.type_changes,
            vec![TypeChange {
                column: "id".to_owned(),
                source_type: "bigint".to_owned(),
                destination_type: "integer".to_owned(),
            }]
        );
    }

    #[test]
    fn primary_key_indexes_are_ignored() {
        let src = table(vec![column("id", "integer")]);
        let delta = compare(
            &src,
            &src,
            &[index("accounts_pkey", true), index("accounts_bal_idx", false)],
            &[index("accounts_pkey", true)],
            &[],
            &[],
        );
        assert_eq!(delta.added_indexes.len(), 1);
        assert_eq!(delta.added_indexes[0].name, "accounts_bal_idx");
        assert!(delta.dropped_indexes.is_empty());
    }
}
