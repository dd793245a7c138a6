use std::collections::{BTreeSet, HashMap, HashSet};

use bcf_core::{Category, Product, ProductId};

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedProduct {
    pub product: Product,
    pub previous_category: Category,
    pub changed_fields: Vec<String>,
}

/// Three-way partition of an incoming snapshot against the stored catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogDiff {
    pub added: Vec<Product>,
    pub updated: Vec<UpdatedProduct>,
    pub deleted: Vec<Product>,
    pub unchanged: usize,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Every category whose candidate pool differs after this diff is applied.
    pub fn touched_categories(&self) -> BTreeSet<Category> {
        let mut out = BTreeSet::new();
        out.extend(self.added.iter().map(|p| p.category));
        for u in &self.updated {
            out.insert(u.product.category);
            out.insert(u.previous_category);
        }
        out.extend(self.deleted.iter().map(|p| p.category));
        out
    }
}

/// Compares the incoming products with what is stored. Classification is by exact
/// fingerprint equality; incoming order is preserved for `added` and `updated`, stored
/// order for `deleted`.
pub fn compute_diff(stored: &[Product], incoming: Vec<Product>) -> CatalogDiff {
    let by_id: HashMap<&ProductId, &Product> = stored.iter().map(|p| (&p.id, p)).collect();
    let mut seen: HashSet<ProductId> = HashSet::with_capacity(incoming.len());
    let mut diff = CatalogDiff::default();

    for product in incoming {
        if !seen.insert(product.id.clone()) {
            continue;
        }
        match by_id.get(&product.id) {
            None => diff.added.push(product),
            Some(existing) if existing.fingerprint == product.fingerprint => diff.unchanged += 1,
            Some(existing) => {
                let changed_fields = changed_fields(existing, &product);
                diff.updated.push(UpdatedProduct {
                    previous_category: existing.category,
                    changed_fields,
                    product,
                });
            }
        }
    }

    diff.deleted = stored
        .iter()
        .filter(|p| !seen.contains(&p.id))
        .cloned()
        .collect();
    diff
}

fn changed_fields(old: &Product, new: &Product) -> Vec<String> {
    let mut fields = Vec::new();
    if old.category != new.category {
        fields.push("category".to_string());
    }
    if old.parent_id != new.parent_id {
        fields.push("parent_id".to_string());
    }
    if old.unique_id != new.unique_id {
        fields.push("unique_id".to_string());
    }
    fields.extend(
        new.attributes
            .changed_keys(&old.attributes)
            .into_iter()
            .map(|k| k.column().to_string()),
    );
    fields
}
