//! Entity request handling.

use spindle_core::{EntityId, Op, RequestId, StatusCode, INVALID_ENTITY_ID};

use super::{Runtime, SessionId};
use crate::msg::{
    AddComponentRequest, ComponentUpdateRequest, CreateEntityRequest, DeleteEntityRequest,
    EntityQueryRequest, InterestChangeRequest, RemoveComponentRequest, ReserveEntityIdsRequest,
};
use crate::Result;

impl Runtime {
    pub(super) fn handle_reserve_entity_ids(
        &mut self,
        id: SessionId,
        request_id: RequestId,
        req: ReserveEntityIdsRequest,
    ) -> Result<()> {
        let op = match self.world.reserve_entity_ids(req.count) {
            Ok(first_entity_id) => Op::ReserveEntityIdsResponse {
                request_id,
                status_code: StatusCode::Success,
                message: String::new(),
                first_entity_id,
                number_of_entity_ids: req.count,
            },
            Err(e) => Op::ReserveEntityIdsResponse {
                request_id,
                status_code: e.status_code(),
                message: e.to_string(),
                first_entity_id: INVALID_ENTITY_ID,
                number_of_entity_ids: 0,
            },
        };
        self.push_op(id, op);
        Ok(())
    }

    pub(super) fn handle_create_entity(
        &mut self,
        id: SessionId,
        request_id: RequestId,
        req: CreateEntityRequest,
    ) -> Result<()> {
        let entity_id = match self.world.create_entity(req.entity_id, req.components) {
            Ok(entity_id) => entity_id,
            Err(e) => {
                self.push_op(
                    id,
                    Op::CreateEntityResponse {
                        request_id,
                        status_code: e.status_code(),
                        message: e.to_string(),
                        entity_id: req.entity_id.unwrap_or(INVALID_ENTITY_ID),
                    },
                );
                return Ok(());
            }
        };
        self.push_op(
            id,
            Op::CreateEntityResponse {
                request_id,
                status_code: StatusCode::Success,
                message: String::new(),
                entity_id,
            },
        );

        let authority = self.lowest_server();
        if let Some(server) = authority {
            self.authority.insert(entity_id, server);
        }
        for session in self.sessions_seeing(entity_id) {
            self.push_entity(session, entity_id);
        }
        if let Some(server) = authority {
            self.push_authority(server, entity_id, true);
        }
        Ok(())
    }

    pub(super) fn handle_delete_entity(
        &mut self,
        id: SessionId,
        request_id: RequestId,
        req: DeleteEntityRequest,
    ) -> Result<()> {
        let entity_id = req.entity_id;
        let seeing = self.sessions_seeing(entity_id);
        let (status_code, message) = match self.world.delete_entity(entity_id) {
            Ok(_) => (StatusCode::Success, String::new()),
            Err(e) => (e.status_code(), e.to_string()),
        };
        self.push_op(
            id,
            Op::DeleteEntityResponse {
                request_id,
                status_code,
                message,
                entity_id,
            },
        );
        if status_code.is_success() {
            self.authority.remove(&entity_id);
            self.overrides_cleanup(entity_id);
            for session in seeing {
                self.push_op(session, Op::RemoveEntity { entity_id });
            }
        }
        Ok(())
    }

    pub(super) fn handle_entity_query(
        &mut self,
        id: SessionId,
        request_id: RequestId,
        req: EntityQueryRequest,
    ) -> Result<()> {
        let result = self.world.query(&req.query);
        self.push_op(
            id,
            Op::EntityQueryResponse {
                request_id,
                status_code: StatusCode::Success,
                message: String::new(),
                result_count: result.count,
                results: result.entities,
            },
        );
        Ok(())
    }

    /// Applies the update if the worker is authoritative, otherwise the
    /// update is dropped and the worker gets a warning.
    pub(super) fn handle_component_update(
        &mut self,
        id: SessionId,
        req: ComponentUpdateRequest,
    ) -> Result<()> {
        let entity_id = req.entity_id;
        if !self.is_authoritative(id, entity_id) {
            self.push_warning(
                id,
                format!(
                    "not authoritative over entity {}, dropping update to component {}",
                    entity_id, req.update.component_id
                ),
            );
            return Ok(());
        }
        if let Err(e) = self.world.update_component(entity_id, &req.update) {
            self.push_warning(id, format!("dropping component update: {}", e));
            return Ok(());
        }
        for session in self.sessions_seeing(entity_id) {
            if session == id {
                continue;
            }
            let interested = self
                .workers
                .get(&session)
                .map(|w| w.interest_for(entity_id).includes(req.update.component_id))
                .unwrap_or(false);
            if interested {
                self.push_op(
                    session,
                    Op::ComponentUpdate {
                        entity_id,
                        update: req.update.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    pub(super) fn handle_add_component(
        &mut self,
        id: SessionId,
        req: AddComponentRequest,
    ) -> Result<()> {
        let entity_id = req.entity_id;
        let component_id = req.data.component_id;
        if !self.is_authoritative(id, entity_id) {
            self.push_warning(
                id,
                format!(
                    "not authoritative over entity {}, dropping added component {}",
                    entity_id, component_id
                ),
            );
            return Ok(());
        }
        let before = self.sessions_seeing(entity_id);
        if let Err(e) = self.world.add_component(entity_id, req.data.clone()) {
            self.push_warning(id, format!("dropping added component: {}", e));
            return Ok(());
        }
        for session in self.sessions_seeing(entity_id) {
            if session == id {
                continue;
            }
            if before.contains(&session) {
                self.push_op(
                    session,
                    Op::AddComponent {
                        entity_id,
                        data: req.data.clone(),
                    },
                );
            } else {
                self.push_entity(session, entity_id);
            }
        }
        self.push_op(
            id,
            Op::AuthorityChange {
                entity_id,
                component_id,
                authoritative: true,
            },
        );
        Ok(())
    }

    pub(super) fn handle_remove_component(
        &mut self,
        id: SessionId,
        req: RemoveComponentRequest,
    ) -> Result<()> {
        let entity_id = req.entity_id;
        let component_id = req.component_id;
        if !self.is_authoritative(id, entity_id) {
            self.push_warning(
                id,
                format!(
                    "not authoritative over entity {}, dropping removal of component {}",
                    entity_id, component_id
                ),
            );
            return Ok(());
        }
        let before = self.sessions_seeing(entity_id);
        if let Err(e) = self.world.remove_component(entity_id, component_id) {
            self.push_warning(id, format!("dropping component removal: {}", e));
            return Ok(());
        }
        let after = self.sessions_seeing(entity_id);
        for session in before {
            if session == id {
                continue;
            }
            if after.contains(&session) {
                self.push_op(
                    session,
                    Op::RemoveComponent {
                        entity_id,
                        component_id,
                    },
                );
            } else {
                self.push_op(session, Op::RemoveEntity { entity_id });
            }
        }
        Ok(())
    }

    /// Changes the worker's interest, sending out the entities it starts
    /// and stops seeing.
    pub(super) fn handle_interest_change(
        &mut self,
        id: SessionId,
        req: InterestChangeRequest,
    ) -> Result<()> {
        let before = self.visible_entities(id);
        match self.workers.get_mut(&id) {
            Some(worker) => match req.entity_id {
                Some(entity_id) => {
                    worker.interest_overrides.insert(entity_id, req.interest);
                }
                None => worker.interest = req.interest,
            },
            None => return Ok(()),
        }
        let after = self.visible_entities(id);

        for entity_id in &before {
            if !after.contains(entity_id) {
                self.push_op(
                    id,
                    Op::RemoveEntity {
                        entity_id: *entity_id,
                    },
                );
            }
        }
        for entity_id in after {
            if !before.contains(&entity_id) {
                self.push_entity(id, entity_id);
            }
        }
        Ok(())
    }

    /// Checks whether the worker gets to see the entity.
    pub(super) fn is_visible(&self, id: SessionId, entity_id: EntityId) -> bool {
        if self.is_authoritative(id, entity_id) {
            return true;
        }
        match (self.workers.get(&id), self.world.entity(entity_id)) {
            (Some(worker), Some(entity)) => worker
                .interest_for(entity_id)
                .includes_any(entity.component_ids().iter()),
            _ => false,
        }
    }

    /// Sessions currently seeing the entity, in session id order.
    pub(super) fn sessions_seeing(&self, entity_id: EntityId) -> Vec<SessionId> {
        self.workers
            .keys()
            .filter(|id| self.is_visible(**id, entity_id))
            .cloned()
            .collect()
    }

    /// Entities currently visible to the worker, in entity id order.
    fn visible_entities(&self, id: SessionId) -> Vec<EntityId> {
        self.world
            .entities()
            .map(|(entity_id, _)| *entity_id)
            .filter(|entity_id| self.is_visible(id, *entity_id))
            .collect()
    }

    /// Queues the entity along with all its components.
    pub(super) fn push_entity(&mut self, id: SessionId, entity_id: EntityId) {
        let components = match self.world.entity(entity_id) {
            Some(entity) => entity.components().into_iter().cloned().collect::<Vec<_>>(),
            None => return,
        };
        self.push_op(id, Op::AddEntity { entity_id });
        for data in components {
            self.push_op(id, Op::AddComponent { entity_id, data });
        }
    }

    /// Queues authority changes for all the components of the entity.
    pub(super) fn push_authority(&mut self, id: SessionId, entity_id: EntityId, authoritative: bool) {
        let component_ids = match self.world.entity(entity_id) {
            Some(entity) => entity.component_ids(),
            None => return,
        };
        for component_id in component_ids {
            self.push_op(
                id,
                Op::AuthorityChange {
                    entity_id,
                    component_id,
                    authoritative,
                },
            );
        }
    }

    fn overrides_cleanup(&mut self, entity_id: EntityId) {
        for worker in self.workers.values_mut() {
            worker.interest_overrides.remove(&entity_id);
        }
    }
}
