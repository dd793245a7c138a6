use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use bcf_core::{Category, CategoryTable, CompatibilityEdge, ProductId, RuleEvaluator, MAX_SCORE};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogStore, ChunkWrite};
use crate::error::SyncError;
use crate::index::ProductIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeSummary {
    pub products_recomputed: u64,
    pub edges_written: u64,
    pub rule_failures: u64,
    pub chunks: u64,
}

/// Regenerates outbound edges for dirty bases, chunk by chunk.
///
/// There is one code path: a full recompute is this same run with every identifier dirty.
/// Each chunk clears then rewrites its bases' edges and marks them computed in a single
/// transaction, so a rerun over the same inputs produces the same rows.
#[derive(Clone)]
pub struct RecomputeEngine {
    evaluator: Arc<dyn RuleEvaluator>,
    table: CategoryTable,
    chunk_size: usize,
    max_rule_failure_fraction: f64,
}

impl std::fmt::Debug for RecomputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecomputeEngine")
            .field("table", &self.table)
            .field("chunk_size", &self.chunk_size)
            .field("max_rule_failure_fraction", &self.max_rule_failure_fraction)
            .finish_non_exhaustive()
    }
}

impl RecomputeEngine {
    pub fn new(evaluator: Arc<dyn RuleEvaluator>, table: CategoryTable) -> Self {
        Self {
            evaluator,
            table,
            chunk_size: 50,
            max_rule_failure_fraction: 0.10,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_rule_failure_fraction(mut self, fraction: f64) -> Self {
        self.max_rule_failure_fraction = fraction;
        self
    }

    pub fn table(&self) -> &CategoryTable {
        &self.table
    }

    pub async fn run(
        &self,
        store: &CatalogStore,
        index: &ProductIndex,
        dirty: &[ProductId],
        job_id: Uuid,
    ) -> Result<RecomputeSummary, SyncError> {
        let pools: HashMap<Category, Vec<&bcf_core::Product>> = Category::ALL
            .into_iter()
            .filter(|c| index.category_len(*c) > 0)
            .map(|c| (c, index.by_category(c)))
            .collect();

        let total = dirty.len();
        let started = Instant::now();
        let mut summary = RecomputeSummary::default();
        let mut processed = 0usize;

        for (chunk_no, chunk) in dirty.chunks(self.chunk_size).enumerate() {
            let span = info_span!("recompute_chunk", %job_id, chunk = chunk_no);
            let (write, failures) = self.evaluate_chunk(chunk, index, &pools);

            summary.rule_failures += failures;
            if total > 0
                && summary.rule_failures as f64 / total as f64 > self.max_rule_failure_fraction
            {
                return Err(SyncError::Recompute(format!(
                    "{} of {} products failed rule evaluation, above the allowed fraction {}",
                    summary.rule_failures, total, self.max_rule_failure_fraction
                )));
            }

            let written = store
                .commit_chunk(&write)
                .instrument(span)
                .await
                .map_err(|err| SyncError::Recompute(format!("chunk {chunk_no}: {err}")))?;

            processed += chunk.len();
            summary.chunks += 1;
            summary.products_recomputed += write.computed.len() as u64;
            summary.edges_written += written;

            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { processed as f64 / elapsed } else { 0.0 };
            let eta_secs = if rate > 0.0 {
                (total - processed) as f64 / rate
            } else {
                0.0
            };
            info!(
                %job_id,
                chunk = chunk_no,
                processed,
                total,
                edges = summary.edges_written,
                rate_per_sec = (rate * 10.0).round() / 10.0,
                eta_secs = eta_secs.round() as u64,
                "recompute progress"
            );
        }

        Ok(summary)
    }

    fn evaluate_chunk(
        &self,
        chunk: &[ProductId],
        index: &ProductIndex,
        pools: &HashMap<Category, Vec<&bcf_core::Product>>,
    ) -> (ChunkWrite, u64) {
        let mut write = ChunkWrite {
            bases: chunk.to_vec(),
            ..ChunkWrite::default()
        };
        let mut failures = 0;

        for id in chunk {
            let Some(base) = index.get(id.as_str()) else {
                continue;
            };
            let mut failed = false;

            for &target in self.table.targets_for(base.category) {
                let pool = pools.get(&target).map(Vec::as_slice).unwrap_or(&[]);
                let evaluation = match self.evaluator.evaluate(base, target, pool) {
                    Ok(evaluation) => evaluation,
                    Err(err) => {
                        warn!(product = %base.id, %target, error = %err, "rule evaluation failed");
                        failed = true;
                        write
                            .reasons
                            .push((base.id.clone(), target, format!("rule evaluation failed: {err}")));
                        continue;
                    }
                };

                let edges = sanitize(&base.id, target, evaluation.matches, index);
                if edges.is_empty() {
                    let reason = evaluation
                        .reason
                        .unwrap_or_else(|| format!("no compatible {target}"));
                    write.reasons.push((base.id.clone(), target, reason));
                }
                write.edges.extend(edges);
            }

            if failed {
                failures += 1;
                write.failed.push(base.id.clone());
            } else {
                write.computed.push((base.id.clone(), base.fingerprint.clone()));
            }
        }

        (write, failures)
    }
}

/// Drops self-matches, unknown or wrong-category targets and duplicates; clamps scores;
/// assigns ranks in evaluator order.
fn sanitize(
    base: &ProductId,
    target: Category,
    matches: Vec<bcf_core::Match>,
    index: &ProductIndex,
) -> Vec<CompatibilityEdge> {
    let mut seen: HashSet<ProductId> = HashSet::with_capacity(matches.len());
    let mut edges = Vec::with_capacity(matches.len());
    for m in matches {
        if &m.target_id == base {
            continue;
        }
        match index.get(m.target_id.as_str()) {
            Some(candidate) if candidate.category == target => {}
            _ => continue,
        }
        if !seen.insert(m.target_id.clone()) {
            continue;
        }
        edges.push(CompatibilityEdge {
            base_id: base.clone(),
            compatible_id: m.target_id,
            target_category: target,
            score: m.score.min(MAX_SCORE),
            rank: edges.len() as u32,
            sidecar: m.sidecar,
        });
    }
    edges
}
