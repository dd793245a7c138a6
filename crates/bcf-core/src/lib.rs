//! Core domain model for the bathroom compatibility catalog.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bcf-core";

/// Maximum compatibility score; also the score carried by forced-include overrides.
pub const MAX_SCORE: u8 = 100;

/// Stable product identifier, normalized to trimmed upper case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Normalizes a raw cell value. Blank cells and spreadsheet `NaN` markers yield `None`.
    pub fn new(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() || normalized == "NAN" {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ProductId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown product category: {0}")]
pub struct UnknownCategory(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Shower Bases")]
    ShowerBases,
    #[serde(rename = "Shower Doors")]
    ShowerDoors,
    #[serde(rename = "Return Panels")]
    ReturnPanels,
    #[serde(rename = "Walls")]
    Walls,
    #[serde(rename = "Enclosures")]
    Enclosures,
    #[serde(rename = "Bathtubs")]
    Bathtubs,
    #[serde(rename = "Tub Doors")]
    TubDoors,
    #[serde(rename = "Showers")]
    Showers,
    #[serde(rename = "Tub Showers")]
    TubShowers,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::ShowerBases,
        Category::ShowerDoors,
        Category::ReturnPanels,
        Category::Walls,
        Category::Enclosures,
        Category::Bathtubs,
        Category::TubDoors,
        Category::Showers,
        Category::TubShowers,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ShowerBases => "Shower Bases",
            Self::ShowerDoors => "Shower Doors",
            Self::ReturnPanels => "Return Panels",
            Self::Walls => "Walls",
            Self::Enclosures => "Enclosures",
            Self::Bathtubs => "Bathtubs",
            Self::TubDoors => "Tub Doors",
            Self::Showers => "Showers",
            Self::TubShowers => "Tub Showers",
        }
    }

    /// Lenient lookup: case, punctuation and a trailing plural `s` are ignored,
    /// so `shower_base`, `Shower Bases` and `SHOWER-BASES` all resolve.
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = category_key(raw);
        if wanted.is_empty() {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|c| category_key(c.as_str()) == wanted)
    }

    pub const fn is_door(self) -> bool {
        matches!(self, Self::ShowerDoors | Self::TubDoors)
    }
}

fn category_key(raw: &str) -> String {
    let compact = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.strip_suffix('s').map(str::to_string).unwrap_or(compact)
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| UnknownCategory(s.trim().to_string()))
    }
}

/// Attribute column names. Well-known columns get their own variant; anything else
/// is carried through as `Extra`. Construct from raw column names with [`AttrKey::from_column`].
///
/// Equality, hashing and ordering all go through [`AttrKey::column`], so `Extra("Brand")`
/// and `Brand` are the same key.
#[derive(Debug, Clone)]
pub enum AttrKey {
    ProductName,
    Brand,
    Family,
    Series,
    Length,
    Width,
    Height,
    NominalDimensions,
    Installation,
    MaxDoorWidth,
    MinWidth,
    MaxWidth,
    GlassThickness,
    DoorType,
    ReturnPanelSize,
    FitsReturnPanelSize,
    CutToSize,
    ImageUrl,
    ProductPageUrl,
    Ranking,
    ReasonDoorsCantFit,
    ReasonWallsCantFit,
    Extra(String),
}

const WELL_KNOWN_KEYS: [AttrKey; 22] = [
    AttrKey::ProductName,
    AttrKey::Brand,
    AttrKey::Family,
    AttrKey::Series,
    AttrKey::Length,
    AttrKey::Width,
    AttrKey::Height,
    AttrKey::NominalDimensions,
    AttrKey::Installation,
    AttrKey::MaxDoorWidth,
    AttrKey::MinWidth,
    AttrKey::MaxWidth,
    AttrKey::GlassThickness,
    AttrKey::DoorType,
    AttrKey::ReturnPanelSize,
    AttrKey::FitsReturnPanelSize,
    AttrKey::CutToSize,
    AttrKey::ImageUrl,
    AttrKey::ProductPageUrl,
    AttrKey::Ranking,
    AttrKey::ReasonDoorsCantFit,
    AttrKey::ReasonWallsCantFit,
];

impl AttrKey {
    pub fn column(&self) -> &str {
        match self {
            Self::ProductName => "Product Name",
            Self::Brand => "Brand",
            Self::Family => "Family",
            Self::Series => "Series",
            Self::Length => "Length",
            Self::Width => "Width",
            Self::Height => "Height",
            Self::NominalDimensions => "Nominal Dimensions",
            Self::Installation => "Installation",
            Self::MaxDoorWidth => "Max Door Width",
            Self::MinWidth => "Min Width",
            Self::MaxWidth => "Max Width",
            Self::GlassThickness => "Glass Thickness",
            Self::DoorType => "Door Type",
            Self::ReturnPanelSize => "Return Panel Size",
            Self::FitsReturnPanelSize => "Fits Return Panel Size",
            Self::CutToSize => "Cut to Size",
            Self::ImageUrl => "Image URL",
            Self::ProductPageUrl => "Product Page URL",
            Self::Ranking => "Ranking",
            Self::ReasonDoorsCantFit => "Reason Doors Can't Fit",
            Self::ReasonWallsCantFit => "Reason Walls Can't Fit",
            Self::Extra(name) => name,
        }
    }

    pub fn from_column(name: &str) -> Self {
        let name = name.trim();
        WELL_KNOWN_KEYS
            .iter()
            .find(|k| k.column() == name)
            .cloned()
            .unwrap_or_else(|| Self::Extra(name.to_string()))
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl PartialEq for AttrKey {
    fn eq(&self, other: &Self) -> bool {
        self.column() == other.column()
    }
}

impl Eq for AttrKey {}

impl Hash for AttrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.column().hash(state);
    }
}

impl PartialOrd for AttrKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttrKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.column().cmp(other.column())
    }
}

impl Serialize for AttrKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.column())
    }
}

impl<'de> Deserialize<'de> for AttrKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_column(&name))
    }
}

/// Schema-light attribute value shared by every product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Number(f64),
    Text(String),
}

impl AttrValue {
    /// Non-finite numbers collapse to `Null`; negative zero is folded into zero.
    pub fn number(value: f64) -> Self {
        if !value.is_finite() {
            Self::Null
        } else if value == 0.0 {
            Self::Number(0.0)
        } else {
            Self::Number(value)
        }
    }

    /// Trimmed text; blank text becomes `Null`.
    pub fn text(value: impl AsRef<str>) -> Self {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            Self::Null
        } else {
            Self::Text(trimmed.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Display form used for comparisons and sidecar fields.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Number(n) => Some(format!("{n}")),
            Self::Text(s) => Some(s.clone()),
        }
    }

    fn canonical(&self) -> String {
        match self {
            Self::Null => "n:".to_string(),
            Self::Number(n) => format!("f:{n}"),
            Self::Text(s) => format!("s:{s}"),
        }
    }
}

/// Ordered attribute bag. Ordering by column name makes the canonical form deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<AttrKey, AttrValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: AttrKey, value: AttrValue) -> Option<AttrValue> {
        self.0.insert(key, value)
    }

    pub fn with(mut self, key: AttrKey, value: AttrValue) -> Self {
        self.0.insert(key, value);
        self
    }

    pub fn get(&self, key: &AttrKey) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn text(&self, key: &AttrKey) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_text)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttrKey, &AttrValue)> {
        self.0.iter()
    }

    /// Keys whose values differ between the two bags, including keys present on one side only.
    pub fn changed_keys(&self, other: &Attributes) -> Vec<AttrKey> {
        let mut changed = Vec::new();
        for (key, value) in &self.0 {
            if other.0.get(key) != Some(value) {
                changed.push(key.clone());
            }
        }
        for key in other.0.keys() {
            if !self.0.contains_key(key) {
                changed.push(key.clone());
            }
        }
        changed.sort();
        changed
    }
}

impl FromIterator<(AttrKey, AttrValue)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (AttrKey, AttrValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Hex SHA-256 over a product's canonicalized contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub parent_id: Option<ProductId>,
    pub unique_id: Option<ProductId>,
    pub category: Category,
    pub attributes: Attributes,
}

impl ProductRecord {
    pub fn new(id: ProductId, category: Category, attributes: Attributes) -> Self {
        Self {
            id,
            parent_id: None,
            unique_id: None,
            category,
            attributes,
        }
    }

    /// Canonical form: unit separator between fields, record separator after each entry.
    pub fn canonical_form(&self) -> String {
        let mut out = String::new();
        out.push_str("category\u{1f}");
        out.push_str(self.category.as_str());
        out.push('\u{1e}');
        out.push_str("parent\u{1f}");
        out.push_str(self.parent_id.as_ref().map(ProductId::as_str).unwrap_or(""));
        out.push('\u{1e}');
        out.push_str("unique\u{1f}");
        out.push_str(self.unique_id.as_ref().map(ProductId::as_str).unwrap_or(""));
        out.push('\u{1e}');
        for (key, value) in self.attributes.iter() {
            out.push_str("attr\u{1f}");
            out.push_str(key.column());
            out.push('\u{1f}');
            out.push_str(&value.canonical());
            out.push('\u{1e}');
        }
        out
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.canonical_form().as_bytes());
        Fingerprint(hex::encode(digest))
    }
}

/// A catalog product as persisted: the parsed record plus its fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub parent_id: Option<ProductId>,
    pub unique_id: Option<ProductId>,
    pub category: Category,
    pub attributes: Attributes,
    pub fingerprint: Fingerprint,
}

impl Product {
    pub fn from_record(record: ProductRecord) -> Self {
        let fingerprint = record.fingerprint();
        Self {
            id: record.id,
            parent_id: record.parent_id,
            unique_id: record.unique_id,
            category: record.category,
            attributes: record.attributes,
            fingerprint,
        }
    }

    pub fn attr(&self, key: &AttrKey) -> Option<&AttrValue> {
        self.attributes.get(key)
    }
}

/// Target-category specific fields carried on an edge so reads avoid a join.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sidecar {
    pub glass_thickness: Option<String>,
    pub door_type: Option<String>,
}

impl Sidecar {
    pub fn from_product(product: &Product) -> Self {
        if !product.category.is_door() {
            return Self::default();
        }
        Self {
            glass_thickness: product
                .attr(&AttrKey::GlassThickness)
                .and_then(AttrValue::render),
            door_type: product.attr(&AttrKey::DoorType).and_then(AttrValue::render),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.glass_thickness.is_none() && self.door_type.is_none()
    }
}

/// Directed base → compatible relationship. `rank` preserves the evaluator's output order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityEdge {
    pub base_id: ProductId,
    pub compatible_id: ProductId,
    pub target_category: Category,
    pub score: u8,
    pub rank: u32,
    pub sidecar: Sidecar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub target_id: ProductId,
    pub score: u8,
    pub sidecar: Sidecar,
}

/// Output of one rule evaluation for a (base, target category) pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Evaluation {
    pub matches: Vec<Match>,
    /// Set only when `matches` is empty and the category was otherwise expected to match.
    pub reason: Option<String>,
}

impl Evaluation {
    pub fn matched(matches: Vec<Match>) -> Self {
        Self {
            matches,
            reason: None,
        }
    }

    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            matches: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("product {id}: attribute `{key}` has unusable value `{value}`")]
    InvalidAttribute {
        id: ProductId,
        key: String,
        value: String,
    },
    #[error("no rule for {base} -> {target}")]
    Unsupported { base: Category, target: Category },
    #[error("{0}")]
    Message(String),
}

/// Pluggable per-category matching rules.
///
/// `pool` holds every catalog product of `target`, in catalog order. Implementations must be
/// deterministic: the recompute engine relies on identical inputs producing identical output.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(
        &self,
        base: &Product,
        target: Category,
        pool: &[&Product],
    ) -> Result<Evaluation, RuleError>;
}

/// Which target categories each source category is matched against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTable {
    targets: BTreeMap<Category, Vec<Category>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryTableFile {
    pub version: u32,
    #[serde(default)]
    pub pairs: Vec<CategoryPair>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryPair {
    pub source: Category,
    pub targets: Vec<Category>,
}

impl CategoryTable {
    pub fn builtin() -> Self {
        Self::from_pairs([
            (
                Category::ShowerBases,
                vec![
                    Category::ShowerDoors,
                    Category::Walls,
                    Category::ReturnPanels,
                    Category::Enclosures,
                ],
            ),
            (Category::Bathtubs, vec![Category::TubDoors, Category::Walls]),
            (Category::Showers, vec![Category::ShowerDoors]),
            (Category::TubShowers, vec![Category::TubDoors]),
        ])
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Category, Vec<Category>)>) -> Self {
        let mut targets: BTreeMap<Category, Vec<Category>> = BTreeMap::new();
        for (source, list) in pairs {
            let entry = targets.entry(source).or_default();
            for target in list {
                if !entry.contains(&target) {
                    entry.push(target);
                }
            }
        }
        Self { targets }
    }

    pub fn from_file(file: CategoryTableFile) -> Self {
        Self::from_pairs(file.pairs.into_iter().map(|p| (p.source, p.targets)))
    }

    pub fn targets_for(&self, source: Category) -> &[Category] {
        self.targets.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Categories whose products match against `target`.
    pub fn sources_for(&self, target: Category) -> Vec<Category> {
        self.targets
            .iter()
            .filter(|(_, list)| list.contains(&target))
            .map(|(source, _)| *source)
            .collect()
    }

    pub fn is_source(&self, category: Category) -> bool {
        !self.targets_for(category).is_empty()
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Manually curated forced-include / forced-exclude lists for one base and target category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    pub base_id: ProductId,
    pub target_category: Category,
    pub include: Vec<ProductId>,
    pub exclude: Vec<ProductId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container format of a snapshot payload, told apart by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    /// An `.xlsx` workbook, one sheet per category.
    Workbook,
}

impl SnapshotFormat {
    const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&Self::ZIP_MAGIC) {
            Self::Workbook
        } else {
            Self::Json
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Workbook => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Webhook,
    LocalSnapshot,
    FullRecompute,
}

impl JobType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::LocalSnapshot => "local_snapshot",
            Self::FullRecompute => "full_recompute",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "webhook" => Some(Self::Webhook),
            "local_snapshot" => Some(Self::LocalSnapshot),
            "full_recompute" => Some(Self::FullRecompute),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCounts {
    pub products_added: u64,
    pub products_updated: u64,
    pub products_deleted: u64,
    pub rows_rejected: u64,
    pub products_recomputed: u64,
    pub edges_written: u64,
    pub rule_failures: u64,
}

/// Durable record of one sync operation. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

/// Crash-recovery anchor: present until the owning job reaches a committed terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub payload_ref: String,
    pub enqueued_at: DateTime<Utc>,
}
