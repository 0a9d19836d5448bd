//! Runtime-side entity storage.

use std::collections::BTreeMap;

use fnv::FnvHashMap;

use crate::component::{ComponentData, ComponentId, ComponentUpdate};
use crate::error::{Error, Result};
use crate::query::{EntityQuery, QueryResult, ResultType};
use crate::EntityId;

/// Upper bound on the number of ids a single reservation can ask for.
pub const MAX_RESERVATION: u32 = 1_000_000;

/// Basic building block of the simulation state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    components: FnvHashMap<ComponentId, ComponentData>,
}

impl Entity {
    pub fn has_component(&self, component_id: ComponentId) -> bool {
        self.components.contains_key(&component_id)
    }

    pub fn component(&self, component_id: ComponentId) -> Option<&ComponentData> {
        self.components.get(&component_id)
    }

    pub fn component_ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.components.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Component data sorted by component id.
    pub fn components(&self) -> Vec<&ComponentData> {
        let mut comps: Vec<&ComponentData> = self.components.values().collect();
        comps.sort_unstable_by_key(|c| c.component_id);
        comps
    }
}

/// Collection of all the entities known to a runtime.
///
/// # Entity ids
///
/// Entity ids are handed out from a monotonically increasing counter and are
/// never reused within the lifetime of a world. Ids can be reserved in
/// contiguous blocks ahead of entity creation. A reserved id can be used
/// for creating exactly one entity.
#[derive(Debug)]
pub struct World {
    entities: BTreeMap<EntityId, Entity>,
    /// Next id to be handed out
    next_entity_id: EntityId,
    /// Reserved id ranges that weren't yet used, keyed by range start,
    /// values are exclusive range ends
    reserved: BTreeMap<EntityId, EntityId>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            next_entity_id: 1,
            reserved: BTreeMap::new(),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (&EntityId, &Entity)> {
        self.entities.iter()
    }

    /// Reserves a contiguous block of entity ids, returning the first one.
    pub fn reserve_entity_ids(&mut self, count: u32) -> Result<EntityId> {
        if count == 0 {
            return Err(Error::InvalidReservation(
                "number of entity ids must be positive".to_string(),
            ));
        }
        if count > MAX_RESERVATION {
            return Err(Error::InvalidReservation(format!(
                "can't reserve more than {} ids at once, requested {}",
                MAX_RESERVATION, count
            )));
        }
        let first = self.next_entity_id;
        self.next_entity_id += count as EntityId;
        self.reserved.insert(first, self.next_entity_id);
        trace!("reserved entity ids {}..{}", first, self.next_entity_id);
        Ok(first)
    }

    pub fn is_reserved(&self, entity_id: EntityId) -> bool {
        self.reserved
            .range(..=entity_id)
            .next_back()
            .map(|(_, end)| entity_id < *end)
            .unwrap_or(false)
    }

    /// Removes a single id from the reserved set, splitting the range it
    /// belongs to if necessary.
    fn take_reserved(&mut self, entity_id: EntityId) -> Result<()> {
        let (start, end) = match self.reserved.range(..=entity_id).next_back() {
            Some((start, end)) if entity_id < *end => (*start, *end),
            _ => return Err(Error::EntityIdNotReserved(entity_id)),
        };
        self.reserved.remove(&start);
        if start < entity_id {
            self.reserved.insert(start, entity_id);
        }
        if entity_id + 1 < end {
            self.reserved.insert(entity_id + 1, end);
        }
        Ok(())
    }

    /// Creates a new entity with the given components.
    ///
    /// If an entity id is provided it has to come from a prior reservation,
    /// otherwise a fresh id is allocated.
    pub fn create_entity(
        &mut self,
        entity_id: Option<EntityId>,
        components: Vec<ComponentData>,
    ) -> Result<EntityId> {
        let mut entity = Entity::default();
        for data in components {
            let component_id = data.component_id;
            if entity.components.insert(component_id, data).is_some() {
                return Err(Error::DuplicateComponent(component_id));
            }
        }

        let id = match entity_id {
            Some(id) => {
                if id <= 0 {
                    return Err(Error::InvalidEntityId(id));
                }
                if self.entities.contains_key(&id) {
                    return Err(Error::EntityAlreadyExists(id));
                }
                self.take_reserved(id)?;
                id
            }
            None => {
                let id = self.next_entity_id;
                self.next_entity_id += 1;
                id
            }
        };

        trace!(
            "creating entity {} with {} components",
            id,
            entity.components.len()
        );
        self.entities.insert(id, entity);
        Ok(id)
    }

    pub fn delete_entity(&mut self, entity_id: EntityId) -> Result<Entity> {
        self.entities
            .remove(&entity_id)
            .ok_or(Error::NoSuchEntity(entity_id))
    }

    pub fn add_component(&mut self, entity_id: EntityId, data: ComponentData) -> Result<()> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(Error::NoSuchEntity(entity_id))?;
        if entity.components.contains_key(&data.component_id) {
            return Err(Error::ComponentAlreadyPresent(
                entity_id,
                data.component_id,
            ));
        }
        entity.components.insert(data.component_id, data);
        Ok(())
    }

    pub fn remove_component(
        &mut self,
        entity_id: EntityId,
        component_id: ComponentId,
    ) -> Result<ComponentData> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(Error::NoSuchEntity(entity_id))?;
        entity
            .components
            .remove(&component_id)
            .ok_or(Error::NoSuchComponent(entity_id, component_id))
    }

    pub fn update_component(&mut self, entity_id: EntityId, update: &ComponentUpdate) -> Result<()> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(Error::NoSuchEntity(entity_id))?;
        let data = entity
            .components
            .get_mut(&update.component_id)
            .ok_or(Error::NoSuchComponent(entity_id, update.component_id))?;
        data.apply_update(update);
        Ok(())
    }

    /// Runs the query against all the stored entities, in entity id order.
    pub fn query(&self, query: &EntityQuery) -> QueryResult {
        let mut result = QueryResult::default();
        for (id, entity) in &self.entities {
            if !query.constraint.matches(*id, entity) {
                continue;
            }
            result.count += 1;
            if let ResultType::Snapshot(component_ids) = &query.result_type {
                let snapshot = entity
                    .components()
                    .into_iter()
                    .filter(|c| component_ids.is_empty() || component_ids.contains(&c.component_id))
                    .cloned()
                    .collect();
                result.entities.push((*id, snapshot));
            }
        }
        result
    }
}
