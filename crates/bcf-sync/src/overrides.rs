//! Read-time application of curated include/exclude rules on top of computed edges.

use std::collections::HashSet;

use bcf_core::{CompatibilityEdge, OverrideRule, ProductId, Sidecar, MAX_SCORE};
use serde::Serialize;

use crate::index::ProductIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeOrder {
    /// Computed edges in evaluator order, then forced includes in rule order.
    #[default]
    Computed,
    /// Score descending; ties keep their `Computed` position.
    ScoreDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedEdge {
    pub compatible_id: ProductId,
    pub score: u8,
    pub forced: bool,
    pub glass_thickness: Option<String>,
    pub door_type: Option<String>,
}

impl MergedEdge {
    fn computed(edge: &CompatibilityEdge) -> Self {
        Self {
            compatible_id: edge.compatible_id.clone(),
            score: edge.score,
            forced: false,
            glass_thickness: edge.sidecar.glass_thickness.clone(),
            door_type: edge.sidecar.door_type.clone(),
        }
    }

    fn forced(id: &ProductId) -> Self {
        Self {
            compatible_id: id.clone(),
            score: MAX_SCORE,
            forced: true,
            glass_thickness: None,
            door_type: None,
        }
    }
}

/// `computed - exclude + (include not already present)`, deduplicated by target.
///
/// Exclusion applies to computed edges only: an identifier that is both excluded and
/// force-included ends up present as a forced entry.
pub fn merge(
    computed: &[CompatibilityEdge],
    rule: Option<&OverrideRule>,
    order: MergeOrder,
) -> Vec<MergedEdge> {
    let excluded: HashSet<&ProductId> = rule.map(|r| r.exclude.iter().collect()).unwrap_or_default();
    let mut present: HashSet<ProductId> = HashSet::with_capacity(computed.len());
    let mut merged = Vec::with_capacity(computed.len());

    for edge in computed {
        if excluded.contains(&edge.compatible_id) || !present.insert(edge.compatible_id.clone()) {
            continue;
        }
        merged.push(MergedEdge::computed(edge));
    }

    if let Some(rule) = rule {
        for id in &rule.include {
            if present.insert(id.clone()) {
                merged.push(MergedEdge::forced(id));
            }
        }
    }

    if order == MergeOrder::ScoreDesc {
        merged.sort_by(|a, b| b.score.cmp(&a.score));
    }
    merged
}

/// Fills sidecar fields of forced entries from the catalog, when the target is known.
pub fn enrich_forced(edges: &mut [MergedEdge], index: &ProductIndex) {
    for edge in edges.iter_mut().filter(|e| e.forced) {
        if let Some(target) = index.get(edge.compatible_id.as_str()) {
            let sidecar = Sidecar::from_product(target);
            edge.glass_thickness = sidecar.glass_thickness;
            edge.door_type = sidecar.door_type;
        }
    }
}
