use common::{
    identifiers::{
        quote_ident,
        quote_qualified,
    },
    mirror::TableMapping,
};
use itertools::Itertools as _;

/// `ceil(approx_rows / rows_per_partition)` with a floor of one.
pub fn partition_count(approx_rows: u64, rows_per_partition: u64) -> u64 {
    if rows_per_partition == 0 {
        return 1;
    }
    approx_rows.div_ceil(rows_per_partition).max(1)
}

/// One slice of a table copy: `mod(abs(hash(key)), total) = index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionSpec {
    pub index: u64,
    pub total: u64,
}

/// The source-side `COPY (SELECT ...) TO STDOUT` for one partition. Without
/// a partition key (or with a single partition) the whole table is one unit.
pub fn copy_out_query(
    mapping: &TableMapping,
    columns: &[String],
    partition: Option<PartitionSpec>,
) -> String {
    let column_list = columns.iter().map(|c| quote_ident(c)).join(", ");
    let table = quote_qualified(&mapping.source_schema, &mapping.source_table);
    let predicate = match (partition, &mapping.partition_key) {
        (Some(p), Some(key)) if p.total > 1 => format!(
            " WHERE mod(abs(hashtext({}::text)::bigint), {}) = {}",
            quote_ident(key),
            p.total,
            p.index,
        ),
        _ => String::new(),
    };
    format!("COPY (SELECT {column_list} FROM {table}{predicate}) TO STDOUT")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mapping(partition_key: Option<&str>) -> TableMapping {
        TableMapping {
            source_schema: "public".to_owned(),
            source_table: "accounts".to_owned(),
            destination_schema: "public".to_owned(),
            destination_table: "accounts".to_owned(),
            partition_key: partition_key.map(str::to_owned),
            excluded_columns: vec![],
        }
    }

    #[test]
    fn partition_count_has_floor_of_one() {
        assert_eq!(partition_count(0, 250_000), 1);
        assert_eq!(partition_count(1, 250_000), 1);
        assert_eq!(partition_count(250_000, 250_000), 1);
        assert_eq!(partition_count(250_001, 250_000), 2);
        assert_eq!(partition_count(1_000_000, 250_000), 4);
    }

    proptest! {
        #[test]
        fn partitions_cover_all_rows(rows in 0u64..10_000_000, per in 1u64..1_000_000) {
            let n = partition_count(rows, per);
            prop_assert!(n >= 1);
            prop_assert!(n.saturating_mul(per) >= rows);
            // Never more partitions than needed.
            prop_assert!((n - 1).saturating_mul(per) < rows || n == 1);
        }
    }

    #[test]
    fn single_unit_without_partition_key() {
        let sql = copy_out_query(
            &mapping(None),
            &["id".to_owned(), "bal".to_owned()],
            Some(PartitionSpec { index: 0, total: 4 }),
        );
        assert_eq!(
            sql,
            r#"COPY (SELECT "id", "bal" FROM "public"."accounts") TO STDOUT"#
        );
    }

    #[test]
    fn partitioned_copy_uses_deterministic_hash_predicate() {
        let sql = copy_out_query(
            &mapping(Some("id")),
            &["id".to_owned()],
            Some(PartitionSpec { index: 2, total: 4 }),
        );
        assert_eq!(
            sql,
            r#"COPY (SELECT "id" FROM "public"."accounts" WHERE mod(abs(hashtext("id"::text)::bigint), 4) = 2) TO STDOUT"#
        );
    }

    #[test]
    fn one_partition_drops_the_predicate() {
        let sql = copy_out_query(
            &mapping(Some("id")),
            &["id".to_owned()],
            Some(PartitionSpec { index: 0, total: 1 }),
        );
        assert!(!sql.contains("WHERE"));
    }
}
