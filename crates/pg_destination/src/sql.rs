//! Statement construction for idempotent record application.
//!
//! Every identifier is double-quoted with embedded-quote doubling; user data
//! only ever appears as bind parameters. Values decoded from the WAL are
//! Postgres text literals, so each placeholder is rendered
//! `($n::text)::<column type>` and the server performs the authoritative
//! cast.

use std::collections::BTreeMap;

use common::{
    errors::ErrorMetadata,
    identifiers::{
        quote_ident,
        quote_qualified,
    },
    ChangeOp,
    ChangeRecord,
};
use itertools::Itertools as _;

/// What the applier needs to know about a destination table: its key and the
/// columns (with types) that exist on the destination. Records are filtered
/// to these columns; source columns the destination lacks are dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableApplyInfo {
    pub primary_key: Vec<String>,
    pub column_types: BTreeMap<String, String>,
}

/// A built statement: SQL plus its text-encoded parameters, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyStatement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

fn placeholder(n: usize, column_type: &str) -> String {
    format!("(${n}::text)::{column_type}")
}

/// Builds the statement applying one change record, or `None` when the
/// record carries nothing applicable (e.g. every changed column was filtered
/// out). Rejections are classified `RecordRejected`.
pub fn build_apply(
    record: &ChangeRecord,
    info: &TableApplyInfo,
    dest_schema: &str,
    dest_table: &str,
) -> anyhow::Result<Option<ApplyStatement>> {
    match record.op {
        ChangeOp::Insert => build_insert(record, info, dest_schema, dest_table),
        ChangeOp::Update => build_update(record, info, dest_schema, dest_table),
        ChangeOp::Delete => build_delete(record, info, dest_schema, dest_table),
    }
}

fn build_insert(
    record: &ChangeRecord,
    info: &TableApplyInfo,
    dest_schema: &str,
    dest_table: &str,
) -> anyhow::Result<Option<ApplyStatement>> {
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (column, value) in &record.new_values {
        let Some(column_type) = info.column_types.get(column) else {
            continue;
        };
        params.push(value.clone());
        columns.push((column.as_str(), column_type.as_str()));
    }
    if columns.is_empty() {
        return Ok(None);
    }
    let column_list = columns.iter().map(|(c, _)| quote_ident(c)).join(", ");
    let value_list = columns
        .iter()
        .enumerate()
        .map(|(i, (_, ty))| placeholder(i + 1, ty))
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
        quote_qualified(dest_schema, dest_table),
        column_list,
        value_list,
    );
    Ok(Some(ApplyStatement { sql, params }))
}

/// Resolves the primary-key values for the WHERE clause: `old_values` when
/// the source sent an old tuple, otherwise the new tuple.
fn key_values<'a>(
    record: &'a ChangeRecord,
    info: &'a TableApplyInfo,
) -> anyhow::Result<Vec<(&'a str, Option<String>)>> {
    if info.primary_key.is_empty() {
        anyhow::bail!(ErrorMetadata::record_rejected(
            "NoKey",
            format!(
                "table {} has no primary key; cannot apply {:?}",
                record.qualified_table(),
                record.op,
            ),
        ));
    }
    let source = record.old_values.as_ref().unwrap_or(&record.new_values);
    let mut key = Vec::with_capacity(info.primary_key.len());
    for pk_column in &info.primary_key {
        match source.get(pk_column.as_str()) {
            Some(value) => key.push((pk_column.as_str(), value.clone())),
            None => anyhow::bail!(ErrorMetadata::record_rejected(
                "MissingKey",
                format!(
                    "record for {} carries no value for key column {pk_column}",
                    record.qualified_table(),
                ),
            )),
        }
    }
    Ok(key)
}

fn build_update(
    record: &ChangeRecord,
    info: &TableApplyInfo,
    dest_schema: &str,
    dest_table: &str,
) -> anyhow::Result<Option<ApplyStatement>> {
    let key = key_values(record, info)?;
    let mut params: Vec<Option<String>> = Vec::new();
    let mut assignments = Vec::new();
    for (column, value) in &record.new_values {
        let Some(column_type) = info.column_types.get(column) else {
            continue;
        };
        params.push(value.clone());
        assignments.push(format!(
            "{} = {}",
            quote_ident(column),
            placeholder(params.len(), column_type),
        ));
    }
    if assignments.is_empty() {
        return Ok(None);
    }
    let mut predicates = Vec::with_capacity(key.len());
    for (pk_column, value) in key {
        let Some(column_type) = info.column_types.get(pk_column) else {
            anyhow::bail!(ErrorMetadata::record_rejected(
                "MissingKey",
                format!("destination lacks key column {pk_column}"),
            ));
        };
        params.push(value);
        predicates.push(format!(
            "{} = {}",
            quote_ident(pk_column),
            placeholder(params.len(), column_type),
        ));
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_qualified(dest_schema, dest_table),
        assignments.join(", "),
        predicates.join(" AND "),
    );
    Ok(Some(ApplyStatement { sql, params }))
}

fn build_delete(
    record: &ChangeRecord,
    info: &TableApplyInfo,
    dest_schema: &str,
    dest_table: &str,
) -> anyhow::Result<Option<ApplyStatement>> {
    if record.old_values.is_none() {
        anyhow::bail!(ErrorMetadata::record_rejected(
            "MissingOldValues",
            format!(
                "DELETE for {} carries no old tuple; replica identity is insufficient",
                record.qualified_table(),
            ),
        ));
    }
    let key = key_values(record, info)?;
    let mut params: Vec<Option<String>> = Vec::new();
    let mut predicates = Vec::with_capacity(key.len());
    for (pk_column, value) in key {
        let Some(column_type) = info.column_types.get(pk_column) else {
            anyhow::bail!(ErrorMetadata::record_rejected(
                "MissingKey",
                format!("destination lacks key column {pk_column}"),
            ));
        };
        params.push(value);
        predicates.push(format!(
            "{} = {}",
            quote_ident(pk_column),
            placeholder(params.len(), column_type),
        ));
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_qualified(dest_schema, dest_table),
        predicates.join(" AND "),
    );
    Ok(Some(ApplyStatement { sql, params }))
}

/// `CREATE TABLE` carrying columns, nullability, non-sequence defaults, and
/// the primary key.
pub fn create_table_sql(
    shape: &schema::TableSchema,
    dest_schema: &str,
    dest_table: &str,
) -> String {
    let mut column_defs = Vec::with_capacity(shape.columns.len());
    for column in &shape.columns {
        let mut def = format!("{} {}", quote_ident(&column.name), column.data_type);
        if let Some(default) = &column.default {
            if !column.has_sequence_default() {
                def.push_str(" DEFAULT ");
                def.push_str(default);
            }
        }
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        column_defs.push(def);
    }
    if !shape.primary_key.is_empty() {
        column_defs.push(format!(
            "PRIMARY KEY ({})",
            shape.primary_key.iter().map(|c| quote_ident(c)).join(", "),
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_qualified(dest_schema, dest_table),
        column_defs.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use common::{
        errors::ErrorMetadataAnyhowExt,
        ChangeOp,
        ChangeRecord,
        Lsn,
    };

    use super::*;

    fn info() -> TableApplyInfo {
        TableApplyInfo {
            primary_key: vec!["id".to_owned()],
            column_types: BTreeMap::from([
                ("id".to_owned(), "integer".to_owned()),
                ("bal".to_owned(), "integer".to_owned()),
            ]),
        }
    }

    fn record(op: ChangeOp) -> ChangeRecord {
        ChangeRecord {
            op,
            schema: "public".to_owned(),
            table: "accounts".to_owned(),
            lsn: Lsn(100),
            column_names: vec!["id".to_owned(), "bal".to_owned()],
            new_values: BTreeMap::from([
                ("id".to_owned(), Some("1".to_owned())),
                ("bal".to_owned(), Some("100".to_owned())),
            ]),
            old_values: None,
            commit_time: None,
        }
    }

    #[test]
    fn insert_is_idempotent_on_conflict() {
        let stmt = build_apply(&record(ChangeOp::Insert), &info(), "public", "accounts")
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "public"."accounts" ("bal", "id") VALUES (($1::text)::integer, ($2::text)::integer) ON CONFLICT DO NOTHING"#
        );
        assert_eq!(
            stmt.params,
            vec![Some("100".to_owned()), Some("1".to_owned())]
        );
    }

    #[test]
    fn update_keys_on_new_values_without_old_tuple() {
        let stmt = build_apply(&record(ChangeOp::Update), &info(), "public", "accounts")
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"UPDATE "public"."accounts" SET "bal" = ($1::text)::integer, "id" = ($2::text)::integer WHERE "id" = ($3::text)::integer"#
        );
        assert_eq!(
            stmt.params,
            vec![
                Some("100".to_owned()),
                Some("1".to_owned()),
                Some("1".to_owned())
            ]
        );
    }

    #[test]
    fn update_prefers_old_tuple_for_key() {
        let mut rec = record(ChangeOp::Update);
        rec.new_values.insert("id".to_owned(), Some("2".to_owned()));
        rec.old_values = Some(BTreeMap::from([
            ("id".to_owned(), Some("1".to_owned())),
            ("bal".to_owned(), None),
        ]));
        let stmt = build_apply(&rec, &info(), "public", "accounts")
            .unwrap()
            .unwrap();
        // SET moves the key to 2; WHERE finds the row by its old key 1.
        assert!(stmt.sql.contains(r#"WHERE "id" = ($3::text)::integer"#));
        assert_eq!(stmt.params[2], Some("1".to_owned()));
    }

    #[test]
    fn update_filters_columns_missing_on_destination() {
        let mut rec = record(ChangeOp::Update);
        rec.new_values
            .insert("note".to_owned(), Some("hello".to_owned()));
        let stmt = build_apply(&rec, &info(), "public", "accounts")
            .unwrap()
            .unwrap();
        assert!(!stmt.sql.contains("note"));
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn update_without_applicable_columns_is_a_noop() {
        let mut rec = record(ChangeOp::Update);
        rec.new_values = BTreeMap::from([("note".to_owned(), Some("x".to_owned()))]);
        rec.old_values = Some(BTreeMap::from([("id".to_owned(), Some("1".to_owned()))]));
        let stmt = build_apply(&rec, &info(), "public", "accounts").unwrap();
        assert!(stmt.is_none());
    }

    #[test]
    fn delete_requires_old_values() {
        let err = build_apply(&record(ChangeOp::Delete), &info(), "public", "accounts")
            .unwrap_err();
        assert!(err.is_record_rejected());
        assert_eq!(err.short_msg(), Some("MissingOldValues"));
    }

    #[test]
    fn delete_builds_key_predicate_from_old_values() {
        let mut rec = record(ChangeOp::Delete);
        rec.new_values = BTreeMap::new();
        rec.old_values = Some(BTreeMap::from([
            ("id".to_owned(), Some("2".to_owned())),
            ("bal".to_owned(), Some("200".to_owned())),
        ]));
        let stmt = build_apply(&rec, &info(), "public", "accounts")
            .unwrap()
            .unwrap();
        assert_eq!(
            stmt.sql,
            r#"DELETE FROM "public"."accounts" WHERE "id" = ($1::text)::integer"#
        );
        assert_eq!(stmt.params, vec![Some("2".to_owned())]);
    }

    #[test]
    fn missing_key_column_is_rejected() {
        let mut rec = record(ChangeOp::Update);
        rec.old_values = Some(BTreeMap::from([("bal".to_owned(), Some("1".to_owned()))]));
        let err = build_apply(&rec, &info(), "public", "accounts").unwrap_err();
        assert!(err.is_record_rejected());
        assert_eq!(err.short_msg(), Some("MissingKey"));
    }

    #[test]
    fn keyless_tables_are_rejected() {
        let keyless = TableApplyInfo {
            primary_key: vec![],
            column_types: info().column_types,
        };
        let err = build_apply(&record(ChangeOp::Update), &keyless, "public", "accounts")
            .unwrap_err();
        assert!(err.is_record_rejected());
        assert_eq!(err.short_msg(), Some("NoKey"));
    }

    #[test]
    fn quoting_survives_hostile_identifiers() {
        let info = TableApplyInfo {
            primary_key: vec!["id".to_owned()],
            column_types: BTreeMap::from([("id".to_owned(), "integer".to_owned())]),
        };
        let mut rec = record(ChangeOp::Insert);
        rec.new_values = BTreeMap::from([("id".to_owned(), Some("1".to_owned()))]);
        let stmt = build_apply(&rec, &info, "we\"ird", "ta\"ble").unwrap().unwrap();
        assert!(stmt.sql.starts_with(r#"INSERT INTO "we""ird"."ta""ble""#));
    }

    #[test]
    fn create_table_carries_shape_and_key() {
        let shape = schema::TableSchema {
            schema: "public".to_owned(),
            name: "accounts".to_owned(),
            columns: vec![
                schema::ColumnSchema {
                    name: "id".to_owned(),
                    data_type: "integer".to_owned(),
                    nullable: false,
                    default: Some("nextval('accounts_id_seq'::regclass)".to_owned()),
                    ordinal: 1,
                },
                schema::ColumnSchema {
                    name: "bal".to_owned(),
                    data_type: "integer".to_owned(),
                    nullable: true,
                    default: Some("0".to_owned()),
                    ordinal: 2,
                },
            ],
            primary_key: vec!["id".to_owned()],
            replica_identity: schema::ReplicaIdentity::Default,
        };
        let sql = create_table_sql(&shape, "mirror", "accounts");
        assert_eq!(
            sql,
            r#"CREATE TABLE IF NOT EXISTS "mirror"."accounts" ("id" integer NOT NULL, "bal" integer DEFAULT 0, PRIMARY KEY ("id"))"#
        );
    }
}
