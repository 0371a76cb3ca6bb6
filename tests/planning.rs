mod common;

use proptest::prelude::*;
use tabular_ingest::{
    ddl::{DdlSettings, plan_table, plan_view},
    join::JoinForest,
    model::{ColumnDescriptor, ColumnType, OperationKind, TableSnapshot},
    sorter::sort_tables,
};

fn snapshot(name: &str, columns: &[(&str, ColumnType)], rows: u64, bytes: u64) -> TableSnapshot {
    let mut descriptors = vec![ColumnDescriptor::row_id()];
    for (column, ty) in columns {
        let mut descriptor = ColumnDescriptor::new(*column, *column, *ty);
        if *ty == ColumnType::String {
            descriptor.max_length = Some(12);
        }
        descriptors.push(descriptor);
    }
    TableSnapshot {
        table_name: name.to_string(),
        columns: descriptors,
        row_count: rows,
        byte_size: bytes,
        operation: OperationKind::Add,
        location: format!("shop/tables/{name}"),
        source_files: vec![format!("{name}.csv")],
        max_row_id: rows,
    }
}

#[test]
fn shared_numeric_id_produces_one_edge() {
    let tables = vec![
        snapshot("customers", &[("id", ColumnType::Number), ("name", ColumnType::String)], 3, 10),
        snapshot("orders", &[("id", ColumnType::Number), ("total", ColumnType::Number)], 5, 10),
    ];
    let forest = JoinForest::build(&tables).unwrap();

    assert_eq!(forest.edges(), vec![(0, 1)]);
    let child = &forest.nodes[1];
    let id = child
        .columns
        .iter()
        .find(|c| c.descriptor.name == "id")
        .unwrap();
    assert!(id.is_join_column);
    assert!(!id.is_selected_column);
    let row_id = &child.columns[0];
    assert!(!row_id.is_join_column && !row_id.is_selected_column);
    let total = child
        .columns
        .iter()
        .find(|c| c.descriptor.name == "total")
        .unwrap();
    assert!(total.is_selected_column);
}

#[test]
fn densest_table_becomes_the_root_after_sorting() {
    let mut tables = vec![
        snapshot("small", &[("id", ColumnType::Number)], 2, 999),
        snapshot("dense", &[("id", ColumnType::Number), ("x", ColumnType::String)], 50, 1),
        snapshot("tie_big", &[("id", ColumnType::Number)], 4, 500),
        snapshot("tie_small", &[("id", ColumnType::Number)], 4, 100),
    ];
    sort_tables(&mut tables);
    let order: Vec<&str> = tables.iter().map(|t| t.table_name.as_str()).collect();
    assert_eq!(order, vec!["dense", "tie_big", "tie_small", "small"]);

    let forest = JoinForest::build(&tables).unwrap();
    assert_eq!(forest.roots().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["dense"]);
    assert_eq!(forest.nodes[0].alias, "A");
    assert!(forest.nodes.iter().skip(1).all(|n| n.parent == Some(0)));
}

#[test]
fn view_selects_each_column_once_and_joins_on_keys() {
    let tables = vec![
        snapshot(
            "orders",
            &[("customer_id", ColumnType::Number), ("total", ColumnType::Number)],
            6,
            100,
        ),
        snapshot(
            "customers",
            &[("customer_id", ColumnType::Number), ("name", ColumnType::String)],
            3,
            50,
        ),
    ];
    let forest = JoinForest::build(&tables).unwrap();
    let settings = DdlSettings::new("lake_db", "s3://lake");
    let view = plan_view(&settings, "Shop", &forest).unwrap();

    assert!(view.starts_with("CREATE VIEW `lake_db`.`shop_view` AS"));
    assert_eq!(view.matches("`customer_id`").count(), 3, "{view}");
    assert!(view.contains("FROM `lake_db`.`shop_orders` A"));
    assert!(view.contains(
        "LEFT JOIN `lake_db`.`shop_customers` B ON B.`customer_id` = A.`customer_id`"
    ));
    assert!(view.contains("B.`name`"));

    let table = plan_table(&settings, "Shop", &tables[1]);
    assert!(table.contains("`name` varchar(12)"));
    assert!(table.contains("LOCATION 's3://lake/shop/tables/customers/'"));
}

fn table_strategy() -> impl Strategy<Value = Vec<TableSnapshot>> {
    let column = (0usize..5, prop::sample::select(vec![
        ColumnType::Number,
        ColumnType::String,
        ColumnType::Date,
    ]));
    prop::collection::vec(prop::collection::vec(column, 0..4), 1..12).prop_map(|tables| {
        tables
            .into_iter()
            .enumerate()
            .map(|(idx, columns)| {
                let mut named: Vec<(String, ColumnType)> = Vec::new();
                for (key, ty) in columns {
                    let name = format!("k{key}");
                    if !named.iter().any(|(n, _)| *n == name) {
                        named.push((name, ty));
                    }
                }
                let refs: Vec<(&str, ColumnType)> =
                    named.iter().map(|(n, ty)| (n.as_str(), *ty)).collect();
                snapshot(&format!("t{idx}"), &refs, 1, 1)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn join_forest_is_acyclic_with_single_parents(tables in table_strategy()) {
        let forest = JoinForest::build(&tables).unwrap();
        prop_assert_eq!(forest.nodes.len(), tables.len());
        for (idx, node) in forest.nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                prop_assert!(parent < idx, "parents always precede their children");
                prop_assert!(!node.join_keys.is_empty());
            }
            let mut steps = 0;
            let mut cursor = Some(idx);
            while let Some(current) = cursor {
                cursor = forest.nodes[current].parent;
                steps += 1;
                prop_assert!(steps <= tables.len());
            }
            for column in &node.columns {
                prop_assert!(!(column.is_join_column && column.is_selected_column));
                if column.descriptor.column_type == ColumnType::Date {
                    prop_assert!(!column.is_join_column);
                }
            }
        }
        let settings = DdlSettings::new("db", "s3://b");
        prop_assert!(plan_view(&settings, "ds", &forest).is_some());
    }
}
