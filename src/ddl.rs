//! Hive-style DDL for the tables and the dataset view.
//!
//! Identifiers are always backtick-quoted and qualified with the configured
//! database. Physical names are derived from the dataset id so several
//! datasets can share one database.

use std::collections::HashSet;

use itertools::Itertools;

use crate::{
    columnar::ParquetCompression,
    join::JoinForest,
    model::{ColumnDescriptor, ColumnType, ROW_ID_COLUMN, TableSnapshot, normalize_table_name},
};

pub const MAX_VARCHAR_LENGTH: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlSettings {
    pub database: String,
    /// Prefix for table locations, e.g. `s3://bucket`.
    pub location_base: String,
    pub varchar_cap: usize,
    pub compression: ParquetCompression,
}

impl DdlSettings {
    pub fn new(database: &str, location_base: &str) -> Self {
        Self {
            database: database.to_string(),
            location_base: location_base.trim_end_matches('/').to_string(),
            varchar_cap: MAX_VARCHAR_LENGTH,
            compression: ParquetCompression::default(),
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}.{}", quote_identifier(&self.database), quote_identifier(name))
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn physical_table_name(dataset_id: &str, table_name: &str) -> String {
    format!(
        "{}_{}",
        normalize_table_name(dataset_id),
        normalize_table_name(table_name)
    )
}

pub fn view_name(dataset_id: &str) -> String {
    format!("{}_view", normalize_table_name(dataset_id))
}

fn column_type_sql(column: &ColumnDescriptor, cap: usize) -> String {
    if column.is_row_id() {
        return "bigint".to_string();
    }
    match column.column_type {
        ColumnType::Number => "double".to_string(),
        ColumnType::Date => "date".to_string(),
        ColumnType::Unknown => "string".to_string(),
        ColumnType::String => {
            let cap = cap.clamp(1, MAX_VARCHAR_LENGTH);
            let length = column.max_length.unwrap_or(cap).clamp(1, cap);
            format!("varchar({length})")
        }
    }
}

/// `CREATE EXTERNAL TABLE` for one squashed table.
pub fn plan_table(settings: &DdlSettings, dataset_id: &str, table: &TableSnapshot) -> String {
    let columns = table
        .columns
        .iter()
        .map(|c| {
            format!(
                "  {} {}",
                quote_identifier(&c.name),
                column_type_sql(c, settings.varchar_cap)
            )
        })
        .join(",\n");
    format!(
        "CREATE EXTERNAL TABLE IF NOT EXISTS {} (\n{columns}\n)\nSTORED AS PARQUET\nLOCATION '{}/{}/'\nTBLPROPERTIES ('parquet.compression'='{}')",
        settings.qualified(&physical_table_name(dataset_id, &table.table_name)),
        settings.location_base,
        table.location.trim_matches('/'),
        settings.compression.table_property()
    )
}

/// `CREATE VIEW` joining every table of the forest, or `None` for an empty forest.
pub fn plan_view(settings: &DdlSettings, dataset_id: &str, forest: &JoinForest) -> Option<String> {
    let first = forest.nodes.first()?;
    let roots: Vec<&str> = forest.roots().map(|n| n.alias.as_str()).collect();
    let row_id = quote_identifier(ROW_ID_COLUMN);

    let mut select = Vec::new();
    if roots.len() == 1 {
        select.push(format!("{}.{row_id} AS {row_id}", first.alias));
    } else {
        let coalesced = roots.iter().map(|alias| format!("{alias}.{row_id}")).join(", ");
        select.push(format!("COALESCE({coalesced}) AS {row_id}"));
    }

    let mut emitted: HashSet<String> = HashSet::from([ROW_ID_COLUMN.to_string()]);
    for node in &forest.nodes {
        for column in node.selected_columns() {
            let source = format!("{}.{}", node.alias, quote_identifier(&column.name));
            // Hive compares identifiers case-insensitively.
            if emitted.insert(column.name.to_lowercase()) {
                select.push(source);
                continue;
            }
            let base = format!("{}_{}", column.name, node.alias.to_lowercase());
            let mut renamed = base.clone();
            let mut attempt = 1;
            while !emitted.insert(renamed.to_lowercase()) {
                attempt += 1;
                renamed = format!("{base}_{attempt}");
            }
            select.push(format!("{source} AS {}", quote_identifier(&renamed)));
        }
    }

    let mut from = vec![format!(
        "FROM {} {}",
        settings.qualified(&physical_table_name(dataset_id, &first.table.table_name)),
        first.alias
    )];
    for node in forest.nodes.iter().skip(1) {
        let target = settings.qualified(&physical_table_name(dataset_id, &node.table.table_name));
        match node.parent {
            None => from.push(format!("FULL OUTER JOIN {target} {} ON 1 = 0", node.alias)),
            Some(parent) => {
                let parent_alias = &forest.nodes[parent].alias;
                let condition = node
                    .join_keys
                    .iter()
                    .map(|key| {
                        let key = quote_identifier(key);
                        format!("{}.{key} = {parent_alias}.{key}", node.alias)
                    })
                    .join(" AND ");
                from.push(format!("LEFT JOIN {target} {} ON {condition}", node.alias));
            }
        }
    }

    Some(format!(
        "CREATE VIEW {} AS\nSELECT\n  {}\n{}",
        settings.qualified(&view_name(dataset_id)),
        select.join(",\n  "),
        from.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationKind;

    fn settings() -> DdlSettings {
        DdlSettings::new("analytics", "s3://bucket/")
    }

    fn table(name: &str, columns: Vec<ColumnDescriptor>) -> TableSnapshot {
        let mut all = vec![ColumnDescriptor::row_id()];
        all.extend(columns);
        TableSnapshot {
            table_name: name.into(),
            columns: all,
            row_count: 1,
            byte_size: 1,
            operation: OperationKind::Add,
            location: format!("sales/tables/{name}"),
            source_files: Vec::new(),
            max_row_id: 1,
        }
    }

    fn text(name: &str, max: usize) -> ColumnDescriptor {
        let mut column = ColumnDescriptor::new(name, name, ColumnType::String);
        column.max_length = Some(max);
        column
    }

    #[test]
    fn table_ddl_maps_types_and_clamps_varchar() {
        let ddl = plan_table(
            &settings(),
            "Sales",
            &table(
                "orders",
                vec![
                    ColumnDescriptor::new("amount", "Amount", ColumnType::Number),
                    text("empty", 0),
                    text("huge", 100_000),
                    ColumnDescriptor::new("day", "Day", ColumnType::Date),
                    ColumnDescriptor::new("other", "Other", ColumnType::Unknown),
                ],
            ),
        );
        assert!(ddl.starts_with("CREATE EXTERNAL TABLE IF NOT EXISTS `analytics`.`sales_orders` ("));
        assert!(ddl.contains("`__row_id` bigint"));
        assert!(ddl.contains("`amount` double"));
        assert!(ddl.contains("`empty` varchar(1)"));
        assert!(ddl.contains("`huge` varchar(65535)"));
        assert!(ddl.contains("`day` date"));
        assert!(ddl.contains("`other` string"));
        assert!(ddl.contains("LOCATION 's3://bucket/sales/tables/orders/'"));
        assert!(ddl.contains("'parquet.compression'='SNAPPY'"));
    }

    #[test]
    fn view_ddl_joins_children_and_aliases_collisions() {
        let tables = vec![
            table(
                "customers",
                vec![ColumnDescriptor::new("id", "id", ColumnType::Number), text("label", 5)],
            ),
            table(
                "orders",
                vec![
                    ColumnDescriptor::new("id", "id", ColumnType::Number),
                    ColumnDescriptor::new("label", "label", ColumnType::Number),
                ],
            ),
        ];
        let forest = JoinForest::build(&tables).unwrap();
        let ddl = plan_view(&settings(), "sales", &forest).unwrap();
        assert!(ddl.starts_with("CREATE VIEW `analytics`.`sales_view` AS"));
        assert!(ddl.contains("A.`__row_id` AS `__row_id`"));
        assert!(ddl.contains("A.`label`,"));
        assert!(ddl.contains("B.`label` AS `label_b`"));
        assert!(ddl.contains(
            "LEFT JOIN `analytics`.`sales_orders` B ON B.`id` = A.`id`"
        ));
    }

    #[test]
    fn renamed_collision_does_not_shadow_a_real_column() {
        let tables = vec![
            table(
                "customers",
                vec![ColumnDescriptor::new("id", "id", ColumnType::Number), text("label", 5)],
            ),
            table(
                "orders",
                vec![
                    ColumnDescriptor::new("id", "id", ColumnType::Number),
                    ColumnDescriptor::new("label", "label", ColumnType::Number),
                ],
            ),
            table(
                "returns",
                vec![ColumnDescriptor::new("id", "id", ColumnType::Number), text("label_b", 3)],
            ),
        ];
        let forest = JoinForest::build(&tables).unwrap();
        let ddl = plan_view(&settings(), "sales", &forest).unwrap();
        assert!(ddl.contains("B.`label` AS `label_b`"), "{ddl}");
        assert!(ddl.contains("C.`label_b` AS `label_b_c`"), "{ddl}");
    }

    #[test]
    fn view_ddl_coalesces_row_ids_across_roots() {
        let tables = vec![table("a", vec![text("x", 1)]), table("b", vec![text("y", 1)])];
        let forest = JoinForest::build(&tables).unwrap();
        let ddl = plan_view(&settings(), "ds", &forest).unwrap();
        assert!(ddl.contains("COALESCE(A.`__row_id`, B.`__row_id`) AS `__row_id`"));
        assert!(ddl.contains("FULL OUTER JOIN `analytics`.`ds_b` B ON 1 = 0"));
    }

    #[test]
    fn empty_forest_has_no_view() {
        assert!(plan_view(&settings(), "ds", &JoinForest::default()).is_none());
    }
}
