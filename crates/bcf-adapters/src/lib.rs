//! Snapshot sources, payload parsing and the default compatibility rules.

mod rules;
mod workbook;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bcf_core::{
    AttrKey, AttrValue, Attributes, Category, OverrideRule, ProductId, ProductRecord,
    SnapshotFormat,
};
use bcf_storage::{read_local_snapshot, FetchError, SnapshotFetcher};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use rules::DimensionalRules;

pub const CRATE_NAME: &str = "bcf-adapters";

/// Column names that carry identity rather than attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayout {
    pub id_column: String,
    pub category_column: String,
    pub parent_column: String,
    pub unique_column: String,
}

impl Default for SnapshotLayout {
    fn default() -> Self {
        Self {
            id_column: "SKU".to_string(),
            category_column: "Category".to_string(),
            parent_column: "Parent SKU".to_string(),
            unique_column: "Unique ID".to_string(),
        }
    }
}

impl SnapshotLayout {
    fn is_identity_column(&self, name: &str) -> bool {
        name == self.id_column
            || name == self.category_column
            || name == self.parent_column
            || name == self.unique_column
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsePolicy {
    /// Rejected rows may make up at most this fraction of all rows.
    pub max_rejected_fraction: f64,
}

impl Default for ParsePolicy {
    fn default() -> Self {
        Self {
            max_rejected_fraction: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRejection {
    NotAnObject { row: usize },
    MissingId { row: usize },
    MissingCategory { row: usize, id: ProductId },
    UnknownCategory { row: usize, id: ProductId, value: String },
    DuplicateId { row: usize, id: ProductId },
}

impl RowRejection {
    pub fn row(&self) -> usize {
        match self {
            Self::NotAnObject { row }
            | Self::MissingId { row }
            | Self::MissingCategory { row, .. }
            | Self::UnknownCategory { row, .. }
            | Self::DuplicateId { row, .. } => *row,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSnapshot {
    pub records: Vec<ProductRecord>,
    pub rejections: Vec<RowRejection>,
    pub total_rows: usize,
    pub exported_at: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot is not valid JSON: {0}")]
    Malformed(String),
    #[error("snapshot workbook is unreadable: {0}")]
    Workbook(String),
    #[error("snapshot contains no usable rows")]
    Empty,
    #[error("snapshot is missing required column `{0}`")]
    MissingColumn(String),
    #[error("{rejected} of {total} rows rejected, above the allowed fraction {limit}")]
    TooManyRejected {
        rejected: usize,
        total: usize,
        limit: f64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
    Wrapped {
        rows: Vec<JsonValue>,
        #[serde(default)]
        exported_at: Option<String>,
        #[serde(default)]
        source: Option<String>,
    },
    Bare(Vec<JsonValue>),
}

impl SnapshotDocument {
    fn parse(bytes: &[u8]) -> Result<Self, SnapshotError> {
        serde_json::from_slice(bytes).map_err(|err| SnapshotError::Malformed(err.to_string()))
    }

    fn into_parts(self) -> (Vec<JsonValue>, Option<String>, Option<String>) {
        match self {
            Self::Wrapped {
                rows,
                exported_at,
                source,
            } => (rows, exported_at, source),
            Self::Bare(rows) => (rows, None, None),
        }
    }
}

/// Maps one JSON cell onto the shared attribute value type. Text is never coerced to a number.
pub fn attr_value_from_json(value: &JsonValue) -> AttrValue {
    match value {
        JsonValue::Null => AttrValue::Null,
        JsonValue::Number(n) => n.as_f64().map(AttrValue::number).unwrap_or(AttrValue::Null),
        JsonValue::String(s) => AttrValue::text(s),
        JsonValue::Bool(b) => AttrValue::Text(b.to_string()),
        other => AttrValue::Text(other.to_string()),
    }
}

fn cell_id(row: &Map<String, JsonValue>, column: &str) -> Option<ProductId> {
    row.get(column)
        .map(attr_value_from_json)
        .and_then(|v| v.render())
        .and_then(|s| ProductId::new(&s))
}

fn has_column(rows: &[JsonValue], column: &str) -> bool {
    rows.iter()
        .filter_map(JsonValue::as_object)
        .any(|row| row.contains_key(column))
}

/// Parses a full snapshot payload into product records.
///
/// JSON payloads and product-feed workbooks are both accepted; a workbook is recognised by its
/// zip header and takes each row's category from its sheet name.
///
/// Individual bad rows are rejected and reported; the whole payload fails only when it is
/// malformed, lacks a required column, yields no products, or rejects more rows than `policy`
/// allows.
pub fn parse_snapshot(
    bytes: &[u8],
    layout: &SnapshotLayout,
    policy: ParsePolicy,
) -> Result<ParsedSnapshot, SnapshotError> {
    let (rows, exported_at, source) = match SnapshotFormat::sniff(bytes) {
        SnapshotFormat::Json => SnapshotDocument::parse(bytes)?.into_parts(),
        SnapshotFormat::Workbook => (workbook::workbook_rows(bytes, layout)?, None, None),
    };
    if rows.is_empty() {
        return Err(SnapshotError::Empty);
    }
    for column in [&layout.id_column, &layout.category_column] {
        if !has_column(&rows, column) {
            return Err(SnapshotError::MissingColumn(column.clone()));
        }
    }

    let total_rows = rows.len();
    let mut records = Vec::with_capacity(total_rows);
    let mut rejections = Vec::new();
    let mut seen = HashSet::with_capacity(total_rows);

    for (idx, row) in rows.iter().enumerate() {
        let row_no = idx + 1;
        match parse_row(row_no, row, layout, &seen) {
            Ok(record) => {
                seen.insert(record.id.clone());
                records.push(record);
            }
            Err(rejection) => {
                warn!(row = row_no, ?rejection, "snapshot row rejected");
                rejections.push(rejection);
            }
        }
    }

    let rejected = rejections.len();
    if rejected as f64 / total_rows as f64 > policy.max_rejected_fraction {
        return Err(SnapshotError::TooManyRejected {
            rejected,
            total: total_rows,
            limit: policy.max_rejected_fraction,
        });
    }
    if records.is_empty() {
        return Err(SnapshotError::Empty);
    }

    Ok(ParsedSnapshot {
        records,
        rejections,
        total_rows,
        exported_at,
        source,
    })
}

fn parse_row(
    row_no: usize,
    row: &JsonValue,
    layout: &SnapshotLayout,
    seen: &HashSet<ProductId>,
) -> Result<ProductRecord, RowRejection> {
    let Some(row) = row.as_object() else {
        return Err(RowRejection::NotAnObject { row: row_no });
    };
    let id = cell_id(row, &layout.id_column).ok_or(RowRejection::MissingId { row: row_no })?;
    if seen.contains(&id) {
        return Err(RowRejection::DuplicateId { row: row_no, id });
    }

    let raw_category = row
        .get(&layout.category_column)
        .map(attr_value_from_json)
        .and_then(|v| v.render());
    let category = match raw_category {
        None => return Err(RowRejection::MissingCategory { row: row_no, id }),
        Some(value) => match Category::parse(&value) {
            Some(category) => category,
            None => return Err(RowRejection::UnknownCategory { row: row_no, id, value }),
        },
    };

    let attributes = row
        .iter()
        .filter(|(name, _)| !layout.is_identity_column(name))
        .map(|(name, value)| (AttrKey::from_column(name), attr_value_from_json(value)))
        .collect::<Attributes>();

    Ok(ProductRecord {
        id,
        parent_id: cell_id(row, &layout.parent_column),
        unique_id: cell_id(row, &layout.unique_column),
        category,
        attributes,
    })
}

/// Splits an identifier list cell. Commas and pipes are both separators, even mixed.
pub fn split_id_list(cell: &str) -> Vec<ProductId> {
    let mut out: Vec<ProductId> = Vec::new();
    for id in cell.split([',', '|']).filter_map(ProductId::new) {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// Parses an override sheet: one row per base product, with `Compatible <Category>` and
/// `Incompatible <Category>` columns holding identifier lists.
pub fn parse_override_sheet(
    bytes: &[u8],
    layout: &SnapshotLayout,
) -> Result<Vec<OverrideRule>, SnapshotError> {
    let (rows, _, _) = SnapshotDocument::parse(bytes)?.into_parts();
    if rows.is_empty() {
        return Err(SnapshotError::Empty);
    }
    if !has_column(&rows, &layout.id_column) {
        return Err(SnapshotError::MissingColumn(layout.id_column.clone()));
    }

    let mut rules: Vec<OverrideRule> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let Some(row) = row.as_object() else {
            warn!(row = idx + 1, "override row is not an object");
            continue;
        };
        let Some(base_id) = cell_id(row, &layout.id_column) else {
            warn!(row = idx + 1, "override row has no identifier");
            continue;
        };

        for (column, value) in row {
            let Some((include, category)) = override_column(column) else {
                continue;
            };
            let ids = attr_value_from_json(value)
                .render()
                .map(|cell| split_id_list(&cell))
                .unwrap_or_default();
            if ids.is_empty() {
                continue;
            }

            let position = rules
                .iter()
                .position(|r| r.base_id == base_id && r.target_category == category);
            let rule = match position {
                Some(pos) => &mut rules[pos],
                None => {
                    rules.push(OverrideRule {
                        base_id: base_id.clone(),
                        target_category: category,
                        include: Vec::new(),
                        exclude: Vec::new(),
                    });
                    let last = rules.len() - 1;
                    &mut rules[last]
                }
            };
            let list = if include {
                &mut rule.include
            } else {
                &mut rule.exclude
            };
            for id in ids {
                if !list.contains(&id) {
                    list.push(id);
                }
            }
        }
    }
    Ok(rules)
}

fn override_column(column: &str) -> Option<(bool, Category)> {
    let column = column.trim();
    if let Some(rest) = column.strip_prefix("Incompatible ") {
        return Category::parse(rest).map(|c| (false, c));
    }
    column
        .strip_prefix("Compatible ")
        .and_then(Category::parse)
        .map(|c| (true, c))
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unsupported payload reference `{0}`")]
    UnsupportedRef(String),
}

/// Where a sync job's snapshot bytes come from.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    async fn load(&self, job_id: Uuid) -> Result<Vec<u8>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    fetcher: Arc<SnapshotFetcher>,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(fetcher: Arc<SnapshotFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn load(&self, job_id: Uuid) -> Result<Vec<u8>, AdapterError> {
        Ok(self.fetcher.fetch(job_id, &self.url).await?.body)
    }
}

#[derive(Debug, Clone)]
pub struct LocalSnapshotSource {
    path: PathBuf,
    max_bytes: u64,
}

impl LocalSnapshotSource {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }
}

#[async_trait]
impl SnapshotSource for LocalSnapshotSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self, _job_id: Uuid) -> Result<Vec<u8>, AdapterError> {
        Ok(read_local_snapshot(&self.path, self.max_bytes).await?)
    }
}

/// Resolves a queued payload reference: `http(s)://` URLs download, `file://` and bare paths
/// read from disk.
pub fn source_for_payload_ref(
    payload_ref: &str,
    fetcher: Arc<SnapshotFetcher>,
) -> Result<Box<dyn SnapshotSource>, AdapterError> {
    let trimmed = payload_ref.trim();
    let max_bytes = fetcher.config().max_bytes;
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(Box::new(HttpSnapshotSource::new(fetcher, trimmed)));
    }
    if let Some(path) = trimmed.strip_prefix("file://") {
        return Ok(Box::new(LocalSnapshotSource::new(path, max_bytes)));
    }
    if trimmed.is_empty() || trimmed.contains("://") {
        return Err(AdapterError::UnsupportedRef(payload_ref.to_string()));
    }
    Ok(Box::new(LocalSnapshotSource::new(trimmed, max_bytes)))
}
