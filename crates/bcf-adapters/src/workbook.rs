//! Product-feed workbooks: one sheet per category, header row first.

use std::io::Cursor;

use bcf_core::Category;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use serde_json::{Map, Number, Value as JsonValue};
use tracing::debug;

use crate::{SnapshotError, SnapshotLayout};

/// Flattens every category sheet into row objects, filling the category column from the sheet
/// name. Sheets that do not name a category are skipped; so are rows with no values at all.
pub(crate) fn workbook_rows(
    bytes: &[u8],
    layout: &SnapshotLayout,
) -> Result<Vec<JsonValue>, SnapshotError> {
    let mut workbook: Xlsx<Cursor<&[u8]>> = open_workbook_from_rs::<Xlsx<_>, _>(Cursor::new(bytes))
        .map_err(|err| SnapshotError::Workbook(err.to_string()))?;

    let mut rows = Vec::new();
    for sheet in workbook.sheet_names() {
        let Some(category) = Category::parse(&sheet) else {
            debug!(sheet = %sheet, "skipping sheet without a category name");
            continue;
        };
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|err| SnapshotError::Workbook(format!("sheet `{sheet}`: {err}")))?;

        let mut lines = range.rows();
        let Some(header) = lines.next() else {
            continue;
        };
        let columns: Vec<Option<String>> = header.iter().map(header_name).collect();

        for line in lines {
            if line.iter().all(|cell| matches!(cell, Data::Empty)) {
                continue;
            }
            let mut row = Map::new();
            for (column, cell) in columns.iter().zip(line) {
                if let Some(column) = column {
                    row.insert(column.clone(), cell_value(cell));
                }
            }
            row.insert(
                layout.category_column.clone(),
                JsonValue::String(category.as_str().to_string()),
            );
            rows.push(JsonValue::Object(row));
        }
    }
    Ok(rows)
}

fn header_name(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        other => {
            let name = other.to_string().trim().to_string();
            (!name.is_empty()).then_some(name)
        }
    }
}

fn cell_value(cell: &Data) -> JsonValue {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => {
            JsonValue::String(s.clone())
        }
        Data::Int(i) => JsonValue::from(*i),
        Data::Float(f) => float(*f),
        Data::Bool(b) => JsonValue::Bool(*b),
        Data::DateTime(dt) => float(dt.as_f64()),
        _ => JsonValue::Null,
    }
}

fn float(value: f64) -> JsonValue {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
