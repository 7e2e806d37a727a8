//! Dependency resolution: orders mapped tables so that referenced entities
//! migrate before the tables that point at them.
//!
//! Edges come from target schema metadata, not hand-maintained lists: if
//! table T maps to entity E and E has a reference field whose target entity
//! is mapped by table U, then U must run before T. Self-references are
//! skipped. Cycles never abort planning; the cycle members are appended in
//! deterministic order and flagged.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::core::EntitySchema;
use crate::mapping::TableMapping;

/// A planned execution order over mapped tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOrder {
    /// Tables in execution order; every table appears exactly once.
    pub tables: Vec<String>,

    /// True when a dependency cycle was detected. The cycle members sit at
    /// the end of `tables` in lexicographic order.
    pub has_cycle: bool,
}

/// A dependency problem found before running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyIssue {
    /// Table whose mapping has the problem.
    pub table: String,

    /// Target field carrying the unresolvable reference.
    pub field: String,

    /// Entity type the reference points at.
    pub entity_type: String,

    /// Human-readable description.
    pub message: String,
}

/// Dependency graph over the mapped tables of one project.
pub struct DependencyResolver {
    /// All participating tables, sorted.
    nodes: BTreeSet<String>,

    /// `deps[t]` = tables that must run before `t`.
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    /// Build the graph from runnable table mappings and their target entity
    /// schemas (keyed by entity type). Reference fields pointing at entities
    /// no mapped table produces contribute no edge; they are a validation
    /// concern, not an ordering one.
    pub fn build(mappings: &[TableMapping], schemas: &HashMap<String, EntitySchema>) -> Self {
        let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
        for tm in mappings.iter().filter(|tm| tm.is_runnable()) {
            if let Some(ref entity) = tm.target_entity_type {
                producers
                    .entry(entity.as_str())
                    .or_default()
                    .push(tm.source_table.as_str());
            }
        }

        let mut nodes = BTreeSet::new();
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for tm in mappings.iter().filter(|tm| tm.is_runnable()) {
            let table = tm.source_table.clone();
            nodes.insert(table.clone());
            let entry = deps.entry(table).or_default();

            let Some(ref entity) = tm.target_entity_type else {
                continue;
            };
            let Some(schema) = schemas.get(entity) else {
                continue;
            };

            for field in schema.reference_fields() {
                let Some(target_entity) = field.field_type.relation() else {
                    continue;
                };
                if target_entity == entity.as_str() {
                    continue;
                }
                if let Some(upstreams) = producers.get(target_entity) {
                    for upstream in upstreams {
                        if *upstream != tm.source_table {
                            entry.insert((*upstream).to_string());
                        }
                    }
                }
            }
        }

        Self { nodes, deps }
    }

    /// Tables `table` depends on.
    pub fn dependencies_of(&self, table: &str) -> Vec<&str> {
        self.deps
            .get(table)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All tables that transitively depend on `table`.
    pub fn dependents_of(&self, table: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut frontier = vec![table.to_string()];
        while let Some(current) = frontier.pop() {
            for (node, deps) in &self.deps {
                if deps.contains(&current) && out.insert(node.clone()) {
                    frontier.push(node.clone());
                }
            }
        }
        out
    }

    /// Kahn's algorithm with a lexicographic frontier, so the order is
    /// deterministic for a given graph. On a cycle the remaining tables are
    /// appended sorted and the order is flagged.
    pub fn order(&self) -> MigrationOrder {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .nodes
            .iter()
            .map(|n| {
                let deps = self
                    .deps
                    .get(n)
                    .map(|d| d.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                (n.as_str(), deps)
            })
            .collect();

        let mut tables = Vec::with_capacity(self.nodes.len());
        loop {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(n, _)| *n)
                .collect();
            if ready.is_empty() {
                break;
            }
            for node in &ready {
                remaining.remove(node);
                tables.push((*node).to_string());
            }
            for deps in remaining.values_mut() {
                for node in &ready {
                    deps.remove(node);
                }
            }
        }

        let has_cycle = !remaining.is_empty();
        if has_cycle {
            let stuck: Vec<&str> = remaining.keys().copied().collect();
            warn!(
                tables = ?stuck,
                "Dependency cycle detected, appending cycle members in name order"
            );
            tables.extend(stuck.iter().map(|s| s.to_string()));
        }

        MigrationOrder { tables, has_cycle }
    }

    /// Group tables into layers where layer N only depends on layers < N.
    /// Tables in one layer can migrate concurrently. Cycle members land
    /// together in a final layer.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let order = self.order();
        let mut level: HashMap<&str, usize> = HashMap::new();
        let mut cycle_members: Vec<String> = Vec::new();

        let acyclic_count = if order.has_cycle {
            let stuck = self.stuck_nodes();
            cycle_members = order
                .tables
                .iter()
                .filter(|t| stuck.contains(t.as_str()))
                .cloned()
                .collect();
            order.tables.len() - cycle_members.len()
        } else {
            order.tables.len()
        };

        let mut layers: Vec<Vec<String>> = Vec::new();
        for table in order.tables.iter().take(acyclic_count) {
            let depth = self
                .dependencies_of(table)
                .iter()
                .filter_map(|d| level.get(d))
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);
            level.insert(table.as_str(), depth);
            if layers.len() <= depth {
                layers.resize_with(depth + 1, Vec::new);
            }
            layers[depth].push(table.clone());
        }

        if !cycle_members.is_empty() {
            layers.push(cycle_members);
        }
        layers
    }

    /// Nodes that can never drain in Kahn's algorithm.
    fn stuck_nodes(&self) -> BTreeSet<&str> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .nodes
            .iter()
            .map(|n| {
                let deps = self
                    .deps
                    .get(n)
                    .map(|d| d.iter().map(String::as_str).collect())
                    .unwrap_or_default();
                (n.as_str(), deps)
            })
            .collect();
        loop {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(n, _)| *n)
                .collect();
            if ready.is_empty() {
                break;
            }
            for node in &ready {
                remaining.remove(node);
            }
            for deps in remaining.values_mut() {
                for node in &ready {
                    deps.remove(node);
                }
            }
        }
        remaining.keys().copied().collect()
    }
}

/// Find required references that would make a run fail outright: the
/// referenced entity is produced by no mapped table AND the target store
/// holds zero records of it. `entity_counts` carries the store counts,
/// keyed by entity type.
pub fn validate_dependencies(
    mappings: &[TableMapping],
    schemas: &HashMap<String, EntitySchema>,
    entity_counts: &HashMap<String, i64>,
) -> Vec<DependencyIssue> {
    let mapped_entities: BTreeSet<&str> = mappings
        .iter()
        .filter(|tm| tm.is_runnable())
        .filter_map(|tm| tm.target_entity_type.as_deref())
        .collect();

    let mut issues = Vec::new();
    for tm in mappings.iter().filter(|tm| tm.is_runnable()) {
        let Some(ref entity) = tm.target_entity_type else {
            continue;
        };
        let Some(schema) = schemas.get(entity) else {
            continue;
        };
        for field in &schema.fields {
            if !field.required {
                continue;
            }
            let Some(target_entity) = field.field_type.relation() else {
                continue;
            };
            if target_entity == entity.as_str() {
                continue;
            }
            if mapped_entities.contains(target_entity) {
                continue;
            }
            let existing = entity_counts.get(target_entity).copied().unwrap_or(0);
            if existing == 0 {
                issues.push(DependencyIssue {
                    table: tm.source_table.clone(),
                    field: field.name.clone(),
                    entity_type: target_entity.to_string(),
                    message: format!(
                        "required reference {} -> {} has no mapped source table and no existing target records",
                        field.name, target_entity
                    ),
                });
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityField, FieldType, SourceColumn, SourceTable};

    fn mapped(table: &str, entity: &str) -> TableMapping {
        let mut tm = TableMapping::discovered(
            &SourceTable {
                name: table.into(),
                schema: "dbo".into(),
                row_count: 0,
            },
            Vec::<SourceColumn>::new(),
        );
        tm.state = crate::mapping::MappingState::Mapped;
        tm.target_entity_type = Some(entity.into());
        tm
    }

    fn schema(entity: &str, refs: &[(&str, &str, bool)]) -> EntitySchema {
        EntitySchema {
            entity_type: entity.into(),
            fields: refs
                .iter()
                .map(|(name, target, required)| EntityField {
                    name: (*name).into(),
                    field_type: FieldType::Reference {
                        target: (*target).into(),
                    },
                    required: *required,
                })
                .collect(),
        }
    }

    fn sales_fixture() -> (Vec<TableMapping>, HashMap<String, EntitySchema>) {
        let mappings = vec![
            mapped("order_lines", "sale.order.line"),
            mapped("orders", "sale.order"),
            mapped("customers", "res.partner"),
            mapped("products", "product.product"),
        ];
        let mut schemas = HashMap::new();
        schemas.insert("res.partner".into(), schema("res.partner", &[]));
        schemas.insert("product.product".into(), schema("product.product", &[]));
        schemas.insert(
            "sale.order".into(),
            schema("sale.order", &[("partner_id", "res.partner", true)]),
        );
        schemas.insert(
            "sale.order.line".into(),
            schema(
                "sale.order.line",
                &[
                    ("order_id", "sale.order", true),
                    ("product_id", "product.product", true),
                ],
            ),
        );
        (mappings, schemas)
    }

    #[test]
    fn test_order_respects_every_edge() {
        let (mappings, schemas) = sales_fixture();
        let resolver = DependencyResolver::build(&mappings, &schemas);
        let order = resolver.order();
        assert!(!order.has_cycle);
        assert_eq!(order.tables.len(), 4);

        let pos = |t: &str| order.tables.iter().position(|x| x == t).unwrap();
        assert!(pos("customers") < pos("orders"));
        assert!(pos("orders") < pos("order_lines"));
        assert!(pos("products") < pos("order_lines"));
    }

    #[test]
    fn test_order_is_deterministic() {
        let (mappings, schemas) = sales_fixture();
        let resolver = DependencyResolver::build(&mappings, &schemas);
        let first = resolver.order();
        let second = resolver.order();
        assert_eq!(first, second);
        // Roots drain in name order.
        assert_eq!(first.tables[0], "customers");
        assert_eq!(first.tables[1], "products");
    }

    #[test]
    fn test_layers_group_independent_tables() {
        let (mappings, schemas) = sales_fixture();
        let resolver = DependencyResolver::build(&mappings, &schemas);
        let layers = resolver.layers();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["customers", "products"]);
        assert_eq!(layers[1], vec!["orders"]);
        assert_eq!(layers[2], vec!["order_lines"]);
    }

    #[test]
    fn test_cycle_flagged_every_table_once() {
        let mappings = vec![mapped("a", "entity.a"), mapped("b", "entity.b")];
        let mut schemas = HashMap::new();
        schemas.insert(
            "entity.a".into(),
            schema("entity.a", &[("b_ref", "entity.b", false)]),
        );
        schemas.insert(
            "entity.b".into(),
            schema("entity.b", &[("a_ref", "entity.a", false)]),
        );

        let resolver = DependencyResolver::build(&mappings, &schemas);
        let order = resolver.order();
        assert!(order.has_cycle);
        assert_eq!(order.tables, vec!["a", "b"]);

        let layers = resolver.layers();
        assert_eq!(layers.last().unwrap().len(), 2);
    }

    #[test]
    fn test_self_reference_is_no_edge() {
        let mappings = vec![mapped("categories", "product.category")];
        let mut schemas = HashMap::new();
        schemas.insert(
            "product.category".into(),
            schema(
                "product.category",
                &[("parent_id", "product.category", false)],
            ),
        );
        let resolver = DependencyResolver::build(&mappings, &schemas);
        let order = resolver.order();
        assert!(!order.has_cycle);
        assert_eq!(order.tables, vec!["categories"]);
    }

    #[test]
    fn test_dependents_of_transitive() {
        let (mappings, schemas) = sales_fixture();
        let resolver = DependencyResolver::build(&mappings, &schemas);
        let dependents = resolver.dependents_of("customers");
        assert!(dependents.contains("orders"));
        assert!(dependents.contains("order_lines"));
        assert!(!dependents.contains("products"));
    }

    #[test]
    fn test_validate_flags_unmapped_required_reference() {
        let mappings = vec![mapped("orders", "sale.order")];
        let mut schemas = HashMap::new();
        schemas.insert(
            "sale.order".into(),
            schema("sale.order", &[("partner_id", "res.partner", true)]),
        );

        // No mapped partners, empty target store.
        let issues = validate_dependencies(&mappings, &schemas, &HashMap::new());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].entity_type, "res.partner");

        // Pre-existing target records satisfy the reference.
        let counts = HashMap::from([("res.partner".to_string(), 12_i64)]);
        assert!(validate_dependencies(&mappings, &schemas, &counts).is_empty());
    }

    #[test]
    fn test_validate_ignores_optional_references() {
        let mappings = vec![mapped("orders", "sale.order")];
        let mut schemas = HashMap::new();
        schemas.insert(
            "sale.order".into(),
            schema("sale.order", &[("campaign_id", "utm.campaign", false)]),
        );
        assert!(validate_dependencies(&mappings, &schemas, &HashMap::new()).is_empty());
    }
}
