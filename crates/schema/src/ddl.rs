//! DDL emission. Statements are built here and executed by the destination
//! adapter; identifiers are always quoted, and index/constraint bodies come
//! verbatim from the source catalog (`pg_get_indexdef` /
//! `pg_get_constraintdef`), never from user input.

use common::identifiers::{
    quote_ident,
    quote_qualified,
};

use crate::types::{
    ColumnSchema,
    ForeignKeyDef,
    IndexDef,
};

/// `ALTER TABLE .. ADD COLUMN` carrying NOT NULL / DEFAULT as on the source,
/// except sequence-backed defaults, which the destination owns.
pub fn add_column_sql(dest_schema: &str, dest_table: &str, column: &ColumnSchema) -> String {
    let mut sql = format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_qualified(dest_schema, dest_table),
        quote_ident(&column.name),
        column.data_type,
    );
    if let Some(default) = &column.default {
        if !column.has_sequence_default() {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

/// Rewrites a verbatim source index definition to target the destination
/// table, optionally inserting CONCURRENTLY and renaming the index.
pub fn index_create_sql(
    index: &IndexDef,
    dest_schema: &str,
    dest_table: &str,
    new_name: Option<&str>,
    concurrently: bool,
) -> String {
    let mut definition = index.definition.clone();
    // pg_get_indexdef always renders "CREATE [UNIQUE] INDEX name ON
    // schema.table USING ...".
    let source_target = format!("ON {}.{}", quote_schema(&index.schema), quote_schema(&index.table));
    let plain_target = format!("ON {}.{}", index.schema, index.table);
    let dest_target = format!("ON {}", quote_qualified(dest_schema, dest_table));
    if definition.contains(&plain_target) {
        definition = definition.replace(&plain_target, &dest_target);
    } else if definition.contains(&source_target) {
        definition = definition.replace(&source_target, &dest_target);
    }
    if let Some(new_name) = new_name {
        definition = definition.replacen(
            &format!("INDEX {}", quote_maybe(&index.name)),
            &format!("INDEX {}", quote_ident(new_name)),
            1,
        );
    }
    if concurrently {
        if let Some(rest) = definition.strip_prefix("CREATE UNIQUE INDEX ") {
            definition = format!("CREATE UNIQUE INDEX CONCURRENTLY {rest}");
        } else if let Some(rest) = definition.strip_prefix("CREATE INDEX ") {
            definition = format!("CREATE INDEX CONCURRENTLY {rest}");
        }
    }
    definition
}

/// The two statements that restore a captured foreign key without a long
/// validation lock: `ADD CONSTRAINT .. NOT VALID`, then
/// `VALIDATE CONSTRAINT`.
pub fn foreign_key_restore_sql(
    fk: &ForeignKeyDef,
    dest_schema: &str,
    dest_table: &str,
    make_deferrable: bool,
) -> (String, String) {
    let table = quote_qualified(dest_schema, dest_table);
    let mut add = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        table,
        quote_ident(&fk.constraint_name),
        fk.definition,
    );
    if make_deferrable && !fk.is_deferrable {
        add.push_str(" DEFERRABLE INITIALLY DEFERRED");
    }
    add.push_str(" NOT VALID");
    let validate = format!(
        "ALTER TABLE {} VALIDATE CONSTRAINT {}",
        table,
        quote_ident(&fk.constraint_name),
    );
    (add, validate)
}

// pg_get_indexdef quotes identifiers only when necessary; match both forms.
fn quote_schema(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        name.to_owned()
    } else {
        quote_ident(name)
    }
}

fn quote_maybe(name: &str) -> String {
    quote_schema(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnSchema;

    fn column(name: &str, data_type: &str, default: Option<&str>, nullable: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.to_owned(),
            data_type: data_type.to_owned(),
            nullable,
            default: default.map(str::to_owned),
            ordinal: 0,
        }
    }

    #[test]
    fn add_column_carries_default() {
        let sql = add_column_sql(
            "public",
            "accounts",
            &column("note", "text", Some("'n/a'::text"), false),
        );
        assert_eq!(
            sql,
            r#"ALTER TABLE "public"."accounts" ADD COLUMN IF NOT EXISTS "note" text DEFAULT 'n/a'::text NOT NULL"#
        );
    }

    #[test]
    fn add_column_skips_sequence_defaults() {
        let sql = add_column_sql(
            "public",
            "accounts",
            &column(
                "seq_id",
                "integer",
                Some("nextval('accounts_seq_id_seq'::regclass)"),
                false,
            ),
        );
        assert!(!sql.contains("DEFAULT"));
        assert!(!sql.contains("nextval"));
        // Only the sequence-backed default is skipped; the constraint stays.
        assert!(sql.ends_with(" NOT NULL"));
    }

    #[test]
    fn add_column_keeps_not_null_without_a_default() {
        let sql = add_column_sql("public", "accounts", &column("note", "text", None, false));
        assert!(sql.ends_with(r#""note" text NOT NULL"#));
    }

    #[test]
    fn index_sql_retargets_and_adds_concurrently() {
        let index = IndexDef {
            schema: "public".to_owned(),
            table: "accounts".to_owned(),
            name: "accounts_bal_idx".to_owned(),
            definition: "CREATE INDEX accounts_bal_idx ON public.accounts USING btree (bal)"
                .to_owned(),
            is_unique: false,
            is_primary: false,
            index_type: "btree".to_owned(),
        };
        let sql = index_create_sql(&index, "mirror", "accounts", None, true);
        assert_eq!(
            sql,
            r#"CREATE INDEX CONCURRENTLY accounts_bal_idx ON "mirror"."accounts" USING btree (bal)"#
        );
    }

    #[test]
    fn index_sql_renames_shadow_indexes() {
        let index = IndexDef {
            schema: "public".to_owned(),
            table: "accounts".to_owned(),
            name: "accounts_bal_idx".to_owned(),
            definition:
                "CREATE UNIQUE INDEX accounts_bal_idx ON public.accounts USING btree (bal)"
                    .to_owned(),
            is_unique: true,
            is_primary: false,
            index_type: "btree".to_owned(),
        };
        let sql = index_create_sql(
            &index,
            "public",
            "accounts_resync",
            Some("accounts_bal_idx_resync"),
            false,
        );
        assert_eq!(
            sql,
            r#"CREATE UNIQUE INDEX "accounts_bal_idx_resync" ON "public"."accounts_resync" USING btree (bal)"#
        );
    }

    #[test]
    fn foreign_key_restore_is_two_phase() {
        let fk = ForeignKeyDef {
            constraint_name: "orders_account_fkey".to_owned(),
            table_schema: "public".to_owned(),
            table_name: "orders".to_owned(),
            referenced_schema: "public".to_owned(),
            referenced_table: "accounts".to_owned(),
            definition: "FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE"
                .to_owned(),
            on_delete: "CASCADE".to_owned(),
            on_update: "NO ACTION".to_owned(),
            is_deferrable: false,
            initially_deferred: false,
        };
        let (add, validate) = foreign_key_restore_sql(&fk, "public", "orders", true);
        assert!(add.ends_with("DEFERRABLE INITIALLY DEFERRED NOT VALID"));
        assert!(add.contains(r#"ADD CONSTRAINT "orders_account_fkey" FOREIGN KEY"#));
        assert_eq!(
            validate,
            r#"ALTER TABLE "public"."orders" VALIDATE CONSTRAINT "orders_account_fkey""#
        );
    }
}
