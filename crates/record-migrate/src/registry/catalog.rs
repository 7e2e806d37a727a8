//! Catalog of well-known source table names and the target entity types
//! they usually map to, grouped into topics for operator triage.

use crate::mapping::suggest::similarity;

/// One catalog pattern: normalized table name, target entity, topic.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub pattern: String,
    pub entity_type: String,
    pub topic: String,
}

/// A table-type suggestion with its confidence score.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySuggestion {
    pub entity_type: String,
    pub topic: String,
    pub confidence: f64,
}

/// Table-name patterns seen across legacy ERP and CRM schemas.
const BUILTIN_PATTERNS: &[(&str, &str, &str)] = &[
    ("customers", "res.partner", "contacts"),
    ("clients", "res.partner", "contacts"),
    ("vendors", "res.partner", "contacts"),
    ("suppliers", "res.partner", "contacts"),
    ("contacts", "res.partner", "contacts"),
    ("products", "product.product", "products"),
    ("items", "product.product", "products"),
    ("articles", "product.product", "products"),
    ("categories", "product.category", "products"),
    ("orders", "sale.order", "sales"),
    ("sales_orders", "sale.order", "sales"),
    ("order_lines", "sale.order.line", "sales"),
    ("order_items", "sale.order.line", "sales"),
    ("order_details", "sale.order.line", "sales"),
    ("invoices", "account.move", "accounting"),
    ("taxes", "account.tax", "accounting"),
    ("payments", "account.payment", "accounting"),
    ("employees", "hr.employee", "hr"),
    ("departments", "hr.department", "hr"),
    ("users", "res.users", "settings"),
    ("countries", "res.country", "settings"),
    ("currencies", "res.currency", "settings"),
];

/// Matches source table names against known patterns using the same
/// similarity tiers as field suggestion.
pub struct EntityCatalog {
    entries: Vec<CatalogEntry>,
}

impl Default for EntityCatalog {
    fn default() -> Self {
        Self {
            entries: BUILTIN_PATTERNS
                .iter()
                .map(|(pattern, entity, topic)| CatalogEntry {
                    pattern: (*pattern).to_string(),
                    entity_type: (*entity).to_string(),
                    topic: (*topic).to_string(),
                })
                .collect(),
        }
    }
}

impl EntityCatalog {
    /// Add a project-specific pattern; later entries win ties, so custom
    /// patterns override built-ins of equal score.
    pub fn with_pattern(
        mut self,
        pattern: impl Into<String>,
        entity_type: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        self.entries.push(CatalogEntry {
            pattern: pattern.into(),
            entity_type: entity_type.into(),
            topic: topic.into(),
        });
        self
    }

    /// Best suggestion for a table name at or above `threshold`.
    pub fn suggest(&self, table_name: &str, threshold: f64) -> Option<EntitySuggestion> {
        self.entries
            .iter()
            .map(|e| (e, similarity(table_name, &e.pattern)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(entry, score)| EntitySuggestion {
                entity_type: entry.entity_type.clone(),
                topic: entry.topic.clone(),
                confidence: score,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_fuzzy_matches() {
        let catalog = EntityCatalog::default();

        let s = catalog.suggest("Customers", 0.5).unwrap();
        assert_eq!(s.entity_type, "res.partner");
        assert_eq!(s.topic, "contacts");
        assert_eq!(s.confidence, 1.0);

        // Containment tier.
        let s = catalog.suggest("tbl_order_lines", 0.5).unwrap();
        assert_eq!(s.entity_type, "sale.order.line");
        assert!(s.confidence < 1.0);
    }

    #[test]
    fn test_no_match_below_threshold() {
        let catalog = EntityCatalog::default();
        assert!(catalog.suggest("zx_audit_trail", 0.5).is_none());
    }

    #[test]
    fn test_custom_pattern_wins_tie() {
        let catalog = EntityCatalog::default().with_pattern("customers", "res.partner.custom", "contacts");
        let s = catalog.suggest("customers", 0.5).unwrap();
        assert_eq!(s.entity_type, "res.partner.custom");
    }
}
