use std::cmp::Ordering;

use crate::model::TableSnapshot;

fn cell_count(table: &TableSnapshot) -> u128 {
    table.row_count as u128 * table.column_count() as u128
}

fn compare(left: &TableSnapshot, right: &TableSnapshot) -> Ordering {
    cell_count(right)
        .cmp(&cell_count(left))
        .then_with(|| right.byte_size.cmp(&left.byte_size))
}

/// Orders tables largest first so the biggest table anchors the join forest.
///
/// Size is rows times columns, ties broken by byte size; the sort is stable.
pub fn sort_tables(tables: &mut [TableSnapshot]) {
    tables.sort_by(compare);
}
