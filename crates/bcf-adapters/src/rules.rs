use std::collections::HashMap;

use bcf_core::{
    AttrKey, AttrValue, Category, Evaluation, Match, Product, ProductId, RuleError, RuleEvaluator,
    Sidecar,
};
use tracing::debug;

const DOOR_BASE_SCORE: u8 = 70;
const SAME_BRAND_BONUS: u8 = 20;
const SAME_FAMILY_BONUS: u8 = 10;
const WALL_NOMINAL_SCORE: u8 = 100;
const WALL_CUT_TO_SIZE_SCORE: u8 = 80;
const RETURN_PANEL_SCORE: u8 = 95;
const ENCLOSURE_SCORE: u8 = 90;
/// Candidates without a usable `Ranking` sort after every ranked one.
const DEFAULT_RANKING: f64 = 999.0;

/// Dimensional matching between bases/tubs and the doors, walls, panels and enclosures
/// that fit them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionalRules;

impl RuleEvaluator for DimensionalRules {
    fn evaluate(
        &self,
        base: &Product,
        target: Category,
        pool: &[&Product],
    ) -> Result<Evaluation, RuleError> {
        if let Some(reason) = blocking_reason(base, target) {
            return Ok(Evaluation::none(reason));
        }

        let mut matches = match target {
            Category::ShowerDoors | Category::TubDoors => match_doors(base, pool)?,
            Category::Walls => match_walls(base, pool)?,
            Category::ReturnPanels => match_return_panels(base, pool),
            Category::Enclosures => match_enclosures(base, pool),
            other => {
                return Err(RuleError::Unsupported {
                    base: base.category,
                    target: other,
                })
            }
        };

        if matches.is_empty() {
            return Ok(Evaluation::none(format!(
                "no compatible {target} for {}",
                describe_dimensions(base)
            )));
        }
        let rankings: HashMap<&ProductId, f64> =
            pool.iter().map(|p| (&p.id, ranking(p))).collect();
        let rank_of = |id: &ProductId| rankings.get(id).copied().unwrap_or(DEFAULT_RANKING);
        matches.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| rank_of(&a.target_id).total_cmp(&rank_of(&b.target_id)))
                .then_with(|| a.target_id.cmp(&b.target_id))
        });
        Ok(Evaluation::matched(matches))
    }
}

/// Merchandising order among equally scored candidates; lower comes first.
fn ranking(product: &Product) -> f64 {
    numeric(product, &AttrKey::Ranking)
        .ok()
        .flatten()
        .unwrap_or(DEFAULT_RANKING)
}

fn blocking_reason(base: &Product, target: Category) -> Option<String> {
    let key = if target.is_door() {
        AttrKey::ReasonDoorsCantFit
    } else if target == Category::Walls {
        AttrKey::ReasonWallsCantFit
    } else {
        return None;
    };
    base.attr(&key).and_then(AttrValue::render)
}

/// Reads a numeric attribute. Text such as `60"` or `60 in` is accepted; anything else that
/// is present but unreadable is an error.
fn numeric(product: &Product, key: &AttrKey) -> Result<Option<f64>, RuleError> {
    match product.attr(key) {
        None | Some(AttrValue::Null) => Ok(None),
        Some(AttrValue::Number(n)) => Ok(Some(*n)),
        Some(AttrValue::Text(raw)) => {
            let cleaned = raw
                .trim()
                .trim_end_matches("in")
                .trim_end_matches('"')
                .trim();
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(|_| RuleError::InvalidAttribute {
                    id: product.id.clone(),
                    key: key.column().to_string(),
                    value: raw.clone(),
                })
        }
    }
}

fn normalized_text(product: &Product, key: &AttrKey) -> Option<String> {
    product.attr(key).and_then(AttrValue::render).map(|s| {
        s.to_lowercase()
            .replace('×', "x")
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '"')
            .collect()
    })
}

/// True only when both sides carry the attribute and it matches.
fn both_equal(a: &Product, b: &Product, key: &AttrKey) -> bool {
    match (normalized_text(a, key), normalized_text(b, key)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// False only when both sides carry the attribute and it differs.
fn not_conflicting(a: &Product, b: &Product, key: &AttrKey) -> bool {
    match (normalized_text(a, key), normalized_text(b, key)) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

fn is_cut_to_size(product: &Product) -> bool {
    match product.attr(&AttrKey::CutToSize) {
        Some(AttrValue::Number(n)) => *n != 0.0,
        Some(AttrValue::Text(s)) => matches!(s.to_lowercase().as_str(), "yes" | "y" | "true"),
        _ => false,
    }
}

fn describe_dimensions(base: &Product) -> String {
    if let Some(nominal) = base.attr(&AttrKey::NominalDimensions).and_then(AttrValue::render) {
        return nominal;
    }
    let length = base.attr(&AttrKey::Length).and_then(AttrValue::render);
    let width = base.attr(&AttrKey::Width).and_then(AttrValue::render);
    match (length, width) {
        (Some(l), Some(w)) => format!("{l} x {w}"),
        (None, Some(w)) => format!("width {w}"),
        _ => "unknown dimensions".to_string(),
    }
}

fn match_doors(base: &Product, pool: &[&Product]) -> Result<Vec<Match>, RuleError> {
    let width = match numeric(base, &AttrKey::MaxDoorWidth)? {
        Some(w) => Some(w),
        None => numeric(base, &AttrKey::Width)?,
    };
    let Some(width) = width else {
        return Ok(Vec::new());
    };

    let mut matches = Vec::new();
    for door in pool {
        let range = numeric(door, &AttrKey::MinWidth).and_then(|min| {
            numeric(door, &AttrKey::MaxWidth).map(|max| min.zip(max))
        });
        let (min, max) = match range {
            Ok(Some(range)) => range,
            Ok(None) => continue,
            Err(err) => {
                debug!(door = %door.id, error = %err, "skipping door candidate");
                continue;
            }
        };
        if width < min || width > max {
            continue;
        }

        let mut score = DOOR_BASE_SCORE;
        if both_equal(base, door, &AttrKey::Brand) {
            score += SAME_BRAND_BONUS;
        }
        if both_equal(base, door, &AttrKey::Family) {
            score += SAME_FAMILY_BONUS;
        }
        matches.push(Match {
            target_id: door.id.clone(),
            score,
            sidecar: Sidecar::from_product(door),
        });
    }
    Ok(matches)
}

fn match_walls(base: &Product, pool: &[&Product]) -> Result<Vec<Match>, RuleError> {
    let base_nominal = normalized_text(base, &AttrKey::NominalDimensions);
    let base_length = numeric(base, &AttrKey::Length)?;
    let base_width = numeric(base, &AttrKey::Width)?;

    let mut matches = Vec::new();
    for wall in pool {
        if !not_conflicting(base, wall, &AttrKey::Brand) {
            continue;
        }
        let score = if is_cut_to_size(wall) {
            let covers = match (base_length, base_width) {
                (Some(bl), Some(bw)) => {
                    let wl = numeric(wall, &AttrKey::Length).ok().flatten();
                    let ww = numeric(wall, &AttrKey::Width).ok().flatten();
                    matches!((wl, ww), (Some(wl), Some(ww)) if wl >= bl && ww >= bw)
                }
                _ => false,
            };
            covers.then_some(WALL_CUT_TO_SIZE_SCORE)
        } else {
            let nominal_match = base_nominal.is_some()
                && base_nominal == normalized_text(wall, &AttrKey::NominalDimensions);
            nominal_match.then_some(WALL_NOMINAL_SCORE)
        };
        if let Some(score) = score {
            matches.push(Match {
                target_id: wall.id.clone(),
                score,
                sidecar: Sidecar::default(),
            });
        }
    }
    Ok(matches)
}

fn match_return_panels(base: &Product, pool: &[&Product]) -> Vec<Match> {
    let Some(wanted) = normalized_text(base, &AttrKey::FitsReturnPanelSize) else {
        return Vec::new();
    };
    pool.iter()
        .filter(|panel| {
            normalized_text(panel, &AttrKey::ReturnPanelSize).as_deref() == Some(wanted.as_str())
        })
        .map(|panel| Match {
            target_id: panel.id.clone(),
            score: RETURN_PANEL_SCORE,
            sidecar: Sidecar::default(),
        })
        .collect()
}

fn match_enclosures(base: &Product, pool: &[&Product]) -> Vec<Match> {
    pool.iter()
        .filter(|enclosure| {
            not_conflicting(base, enclosure, &AttrKey::Brand)
                && both_equal(base, enclosure, &AttrKey::NominalDimensions)
        })
        .map(|enclosure| Match {
            target_id: enclosure.id.clone(),
            score: ENCLOSURE_SCORE,
            sidecar: Sidecar::default(),
        })
        .collect()
}
