use std::collections::HashMap;

use bcf_core::{Category, Product, ProductId};

/// In-memory lookup over one catalog state. Built once per sync cycle, after apply.
#[derive(Debug, Clone, Default)]
pub struct ProductIndex {
    products: Vec<Product>,
    by_id: HashMap<ProductId, usize>,
    by_category: HashMap<Category, Vec<usize>>,
    by_unique: HashMap<ProductId, usize>,
    by_parent: HashMap<ProductId, usize>,
}

impl ProductIndex {
    /// `products` must be in catalog order; category sequences keep that order.
    pub fn build(products: Vec<Product>) -> Self {
        let mut by_id = HashMap::with_capacity(products.len());
        let mut by_category: HashMap<Category, Vec<usize>> = HashMap::new();
        let mut by_unique = HashMap::new();
        let mut by_parent = HashMap::new();

        for (pos, product) in products.iter().enumerate() {
            by_id.insert(product.id.clone(), pos);
            by_category.entry(product.category).or_default().push(pos);
            if let Some(unique) = &product.unique_id {
                by_unique.entry(unique.clone()).or_insert(pos);
            }
            if let Some(parent) = &product.parent_id {
                by_parent.entry(parent.clone()).or_insert(pos);
            }
        }

        Self {
            products,
            by_id,
            by_category,
            by_unique,
            by_parent,
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Product> {
        self.by_id.get(id).map(|&pos| &self.products[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn by_category(&self, category: Category) -> Vec<&Product> {
        self.by_category
            .get(&category)
            .map(|positions| positions.iter().map(|&pos| &self.products[pos]).collect())
            .unwrap_or_default()
    }

    pub fn category_len(&self, category: Category) -> usize {
        self.by_category.get(&category).map_or(0, Vec::len)
    }

    /// Looks a product up by identifier, then unique identifier, then parent identifier.
    /// Parent lookups return the first product of that family in catalog order.
    pub fn resolve(&self, key: &str) -> Option<&Product> {
        let key = ProductId::new(key)?;
        let pos = self
            .by_id
            .get(&key)
            .or_else(|| self.by_unique.get(&key))
            .or_else(|| self.by_parent.get(&key))?;
        Some(&self.products[*pos])
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProductId> {
        self.products.iter().map(|p| &p.id)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }
}
