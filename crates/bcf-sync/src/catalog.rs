use std::collections::{BTreeMap, BTreeSet};

use bcf_core::{
    Attributes, Category, CompatibilityEdge, Fingerprint, OverrideRule, Product, ProductId,
    Sidecar,
};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::diff::CatalogDiff;
use crate::error::SyncError;

/// Rows per multi-row INSERT; keeps every statement well under SQLite's bind limit.
const INSERT_BATCH: usize = 100;
/// Identifiers per `IN (...)` list.
const ID_BATCH: usize = 500;

const PRODUCT_COLUMNS: &str =
    "id, parent_id, unique_id, category, attributes_json, fingerprint, computed_fingerprint";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Unchanged products whose edges were invalidated because their candidate pool changed.
    pub propagated: u64,
}

/// Everything one recompute chunk writes, committed in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct ChunkWrite {
    pub bases: Vec<ProductId>,
    pub edges: Vec<CompatibilityEdge>,
    pub reasons: Vec<(ProductId, Category, String)>,
    pub computed: Vec<(ProductId, Fingerprint)>,
    /// Bases whose rule evaluation failed; they stay dirty for the next run.
    pub failed: Vec<ProductId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchReason {
    pub target_category: Category,
    pub reason: String,
}

/// Persistent products, edges, reasons and override rules.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

fn parse_category(raw: &str) -> Result<Category, SyncError> {
    Category::parse(raw).ok_or_else(|| SyncError::Corrupt(format!("unknown category `{raw}`")))
}

fn parse_id(raw: &str) -> Result<ProductId, SyncError> {
    ProductId::new(raw).ok_or_else(|| SyncError::Corrupt(format!("blank product id `{raw}`")))
}

fn product_from_row(row: &SqliteRow) -> Result<Product, SyncError> {
    let id: String = row.try_get("id")?;
    let parent: Option<String> = row.try_get("parent_id")?;
    let unique: Option<String> = row.try_get("unique_id")?;
    let category: String = row.try_get("category")?;
    let attributes_json: String = row.try_get("attributes_json")?;
    let fingerprint: String = row.try_get("fingerprint")?;
    let attributes: Attributes = serde_json::from_str(&attributes_json)
        .map_err(|err| SyncError::Corrupt(format!("attributes of {id}: {err}")))?;

    Ok(Product {
        id: parse_id(&id)?,
        parent_id: parent.as_deref().and_then(ProductId::new),
        unique_id: unique.as_deref().and_then(ProductId::new),
        category: parse_category(&category)?,
        attributes,
        fingerprint: Fingerprint::from_hex(fingerprint),
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<CompatibilityEdge, SyncError> {
    let base_id: String = row.try_get("base_id")?;
    let compatible_id: String = row.try_get("compatible_id")?;
    let category: String = row.try_get("target_category")?;
    let score: i64 = row.try_get("score")?;
    let rank: i64 = row.try_get("rank")?;
    Ok(CompatibilityEdge {
        base_id: parse_id(&base_id)?,
        compatible_id: parse_id(&compatible_id)?,
        target_category: parse_category(&category)?,
        score: u8::try_from(score)
            .map_err(|_| SyncError::Corrupt(format!("edge score {score} out of range")))?,
        rank: u32::try_from(rank)
            .map_err(|_| SyncError::Corrupt(format!("edge rank {rank} out of range")))?,
        sidecar: Sidecar {
            glass_thickness: row.try_get("glass_thickness")?,
            door_type: row.try_get("door_type")?,
        },
    })
}

fn attributes_json(attributes: &Attributes) -> Result<String, sqlx::Error> {
    serde_json::to_string(attributes).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

async fn execute_where_in(
    tx: &mut Transaction<'_, Sqlite>,
    prefix: &str,
    ids: &[String],
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;
    for batch in ids.chunks(ID_BATCH) {
        let mut qb = QueryBuilder::<Sqlite>::new(prefix);
        qb.push(" (");
        let mut list = qb.separated(", ");
        for id in batch {
            list.push_bind(id.clone());
        }
        list.push_unseparated(")");
        affected += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(affected)
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All products in catalog (insertion) order.
    pub async fn load_products(&self) -> Result<Vec<Product>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY position, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(product_from_row).collect()
    }

    pub async fn product_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn counts_by_category(&self) -> Result<BTreeMap<Category, u64>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT category, COUNT(*) AS n
              FROM products
             GROUP BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let category: String = row.try_get("category")?;
            let n: i64 = row.try_get("n")?;
            out.insert(parse_category(&category)?, n as u64);
        }
        Ok(out)
    }

    pub async fn edge_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM compatibility_edges")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Products whose edges do not reflect their current fingerprint, in catalog order.
    pub async fn dirty_ids(&self) -> Result<Vec<ProductId>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM products
             WHERE computed_fingerprint IS NULL
                OR computed_fingerprint <> fingerprint
             ORDER BY position, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_id(&row.try_get::<String, _>("id")?))
            .collect()
    }

    pub async fn dirty_count(&self) -> Result<u64, SyncError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM products
             WHERE computed_fingerprint IS NULL
                OR computed_fingerprint <> fingerprint
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Applies a diff in one transaction. New products start dirty; updated products become
    /// dirty because their fingerprint moves; products of `propagate_to` categories are
    /// invalidated explicitly.
    pub async fn apply_diff(
        &self,
        diff: &CatalogDiff,
        propagate_to: &BTreeSet<Category>,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();

        let deleted: Vec<String> = diff.deleted.iter().map(|p| p.id.to_string()).collect();
        outcome.deleted = execute_where_in(&mut tx, "DELETE FROM products WHERE id IN", &deleted).await?;

        let next_position: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(position) + 1, 0) FROM products")
                .fetch_one(&mut *tx)
                .await?;

        for (batch_no, batch) in diff.added.chunks(INSERT_BATCH).enumerate() {
            let rows = batch
                .iter()
                .map(|p| Ok((p, attributes_json(&p.attributes)?)))
                .collect::<Result<Vec<_>, sqlx::Error>>()?;
            let base_position = next_position + (batch_no * INSERT_BATCH) as i64;
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO products (id, parent_id, unique_id, category, attributes_json, \
                 fingerprint, computed_fingerprint, position, created_at, updated_at) ",
            );
            qb.push_values(rows.iter().enumerate(), |mut b, (offset, (p, attrs))| {
                b.push_bind(p.id.to_string())
                    .push_bind(p.parent_id.as_ref().map(ToString::to_string))
                    .push_bind(p.unique_id.as_ref().map(ToString::to_string))
                    .push_bind(p.category.as_str())
                    .push_bind(attrs.clone())
                    .push_bind(p.fingerprint.to_string())
                    .push_bind(Option::<String>::None)
                    .push_bind(base_position + offset as i64)
                    .push_bind(now.clone())
                    .push_bind(now.clone());
            });
            outcome.added += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        for update in &diff.updated {
            let p = &update.product;
            outcome.updated += sqlx::query(
                r#"
                UPDATE products
                   SET parent_id = ?,
                       unique_id = ?,
                       category = ?,
                       attributes_json = ?,
                       fingerprint = ?,
                       updated_at = ?
                 WHERE id = ?
                "#,
            )
            .bind(p.parent_id.as_ref().map(ToString::to_string))
            .bind(p.unique_id.as_ref().map(ToString::to_string))
            .bind(p.category.as_str())
            .bind(attributes_json(&p.attributes)?)
            .bind(p.fingerprint.to_string())
            .bind(&now)
            .bind(p.id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        if !propagate_to.is_empty() {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE products SET computed_fingerprint = NULL \
                 WHERE computed_fingerprint IS NOT NULL \
                   AND computed_fingerprint = fingerprint \
                   AND category IN (",
            );
            let mut list = qb.separated(", ");
            for category in propagate_to {
                list.push_bind(category.as_str());
            }
            list.push_unseparated(")");
            outcome.propagated = qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(?outcome, "catalog diff applied");
        Ok(outcome)
    }

    /// Replaces the edges and reasons of `write.bases` and marks them computed, atomically.
    pub async fn commit_chunk(&self, write: &ChunkWrite) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let bases: Vec<String> = write.bases.iter().map(ToString::to_string).collect();
        execute_where_in(&mut tx, "DELETE FROM compatibility_edges WHERE base_id IN", &bases).await?;
        execute_where_in(&mut tx, "DELETE FROM match_reasons WHERE base_id IN", &bases).await?;

        let mut written = 0;
        for batch in write.edges.chunks(INSERT_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO compatibility_edges (base_id, compatible_id, target_category, \
                 score, rank, glass_thickness, door_type) ",
            );
            qb.push_values(batch, |mut b, edge| {
                b.push_bind(edge.base_id.to_string())
                    .push_bind(edge.compatible_id.to_string())
                    .push_bind(edge.target_category.as_str())
                    .push_bind(i64::from(edge.score))
                    .push_bind(i64::from(edge.rank))
                    .push_bind(edge.sidecar.glass_thickness.clone())
                    .push_bind(edge.sidecar.door_type.clone());
            });
            written += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        for batch in write.reasons.chunks(INSERT_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO match_reasons (base_id, target_category, reason) ",
            );
            qb.push_values(batch, |mut b, (base, category, reason)| {
                b.push_bind(base.to_string())
                    .push_bind(category.as_str())
                    .push_bind(reason.clone());
            });
            qb.build().execute(&mut *tx).await?;
        }

        for (id, fingerprint) in &write.computed {
            sqlx::query("UPDATE products SET computed_fingerprint = ? WHERE id = ?")
                .bind(fingerprint.to_string())
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }
        let failed: Vec<String> = write.failed.iter().map(ToString::to_string).collect();
        execute_where_in(
            &mut tx,
            "UPDATE products SET computed_fingerprint = NULL WHERE id IN",
            &failed,
        )
        .await?;

        tx.commit().await?;
        Ok(written)
    }

    /// Stored edges of one base, grouped by category and in evaluator order within each.
    pub async fn edges_for(
        &self,
        base: &ProductId,
        category: Option<Category>,
    ) -> Result<Vec<CompatibilityEdge>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT base_id, compatible_id, target_category, score, rank, glass_thickness, door_type
              FROM compatibility_edges
             WHERE base_id = ?
               AND (? IS NULL OR target_category = ?)
             ORDER BY target_category, rank
            "#,
        )
        .bind(base.to_string())
        .bind(category.map(Category::as_str))
        .bind(category.map(Category::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    /// Every edge, ordered by (base, compatible). Used for whole-table comparisons.
    pub async fn all_edges(&self) -> Result<Vec<CompatibilityEdge>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT base_id, compatible_id, target_category, score, rank, glass_thickness, door_type
              FROM compatibility_edges
             ORDER BY base_id, compatible_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(edge_from_row).collect()
    }

    pub async fn reasons_for(&self, base: &ProductId) -> Result<Vec<MatchReason>, SyncError> {
        let rows = sqlx::query(
            "SELECT target_category, reason FROM match_reasons WHERE base_id = ? ORDER BY target_category",
        )
        .bind(base.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MatchReason {
                    target_category: parse_category(&row.try_get::<String, _>("target_category")?)?,
                    reason: row.try_get("reason")?,
                })
            })
            .collect()
    }

    /// Upserts curated override rules. Returns the number of rules written.
    pub async fn upsert_overrides(&self, rules: &[OverrideRule]) -> Result<u64, SyncError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for rule in rules {
            let include = serde_json::to_string(&rule.include)
                .map_err(|err| SyncError::Corrupt(err.to_string()))?;
            let exclude = serde_json::to_string(&rule.exclude)
                .map_err(|err| SyncError::Corrupt(err.to_string()))?;
            written += sqlx::query(
                r#"
                INSERT INTO override_rules (base_id, target_category, include_json, exclude_json, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (base_id, target_category) DO UPDATE SET
                    include_json = excluded.include_json,
                    exclude_json = excluded.exclude_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(rule.base_id.to_string())
            .bind(rule.target_category.as_str())
            .bind(include)
            .bind(exclude)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn overrides_for(&self, base: &ProductId) -> Result<Vec<OverrideRule>, SyncError> {
        let rows = sqlx::query(
            r#"
            SELECT base_id, target_category, include_json, exclude_json
              FROM override_rules
             WHERE base_id = ?
             ORDER BY target_category
            "#,
        )
        .bind(base.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let include: String = row.try_get("include_json")?;
            let exclude: String = row.try_get("exclude_json")?;
            out.push(OverrideRule {
                base_id: parse_id(&row.try_get::<String, _>("base_id")?)?,
                target_category: parse_category(&row.try_get::<String, _>("target_category")?)?,
                include: serde_json::from_str(&include)
                    .map_err(|err| SyncError::Corrupt(format!("override include list: {err}")))?,
                exclude: serde_json::from_str(&exclude)
                    .map_err(|err| SyncError::Corrupt(format!("override exclude list: {err}")))?,
            });
        }
        Ok(out)
    }
}
