//! Entity queries.

use crate::component::{ComponentData, ComponentId};
use crate::world::Entity;
use crate::EntityId;

/// Predicate selecting a subset of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    EntityId(EntityId),
    Component(ComponentId),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Not(Box<Constraint>),
    All,
}

impl Constraint {
    pub fn matches(&self, entity_id: EntityId, entity: &Entity) -> bool {
        match self {
            Constraint::EntityId(id) => *id == entity_id,
            Constraint::Component(component_id) => entity.has_component(*component_id),
            Constraint::And(cs) => cs.iter().all(|c| c.matches(entity_id, entity)),
            Constraint::Or(cs) => cs.iter().any(|c| c.matches(entity_id, entity)),
            Constraint::Not(c) => !c.matches(entity_id, entity),
            Constraint::All => true,
        }
    }
}

/// Defines what the query returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultType {
    /// Only the number of matching entities
    Count,
    /// Matching entities with a copy of the listed components, empty list
    /// means all components
    Snapshot(Vec<ComponentId>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub constraint: Constraint,
    pub result_type: ResultType,
}

impl EntityQuery {
    pub fn count(constraint: Constraint) -> Self {
        Self {
            constraint,
            result_type: ResultType::Count,
        }
    }

    pub fn snapshot(constraint: Constraint, components: Vec<ComponentId>) -> Self {
        Self {
            constraint,
            result_type: ResultType::Snapshot(components),
        }
    }
}

/// Product of running a query against the world.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub count: u32,
    pub entities: Vec<(EntityId, Vec<ComponentData>)>,
}
