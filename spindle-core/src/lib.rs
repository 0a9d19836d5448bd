//! This library implements the data model shared by `spindle` workers and
//! the runtime they connect to.
//!
//! Simulation state is made up of *entities*, each identified by a
//! deployment-unique [`EntityId`] and holding a set of *components*. Workers
//! never touch the runtime's state directly. Instead they send requests over
//! their connection and observe the results as *operations* ([`Op`]),
//! delivered in ordered batches ([`OpList`]).
//!
//! # Networking
//!
//! By itself, this library does not provide any networking capability. The
//! [`World`] structure is the storage used by the runtime to serve worker
//! requests. For the connection layer see `spindle-net`.
//!
//! ## Example
//!
//! ```
//! use spindle_core::{ComponentData, Value, World};
//!
//! let mut world = World::new();
//! let first = world.reserve_entity_ids(2).unwrap();
//! let position = ComponentData::new(54).with_field("x", Value::Float(1.5));
//! world.create_entity(Some(first), vec![position]).unwrap();
//! assert_eq!(world.entity_count(), 1);
//! ```
//!
//! [`EntityId`]: type.EntityId.html
//! [`Op`]: op/enum.Op.html
//! [`OpList`]: op/struct.OpList.html
//! [`World`]: world/struct.World.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use component::{ComponentData, ComponentId, ComponentUpdate, Fields, Interest, Value};
pub use error::{Error, Result};
pub use op::{LogLevel, Metrics, Op, OpList, OpType, RequestId, StatusCode};
pub use query::{Constraint, EntityQuery, QueryResult, ResultType};
pub use world::{Entity, World};

pub mod component;
pub mod error;
pub mod op;
pub mod query;
pub mod world;

/// Deployment-unique entity identifier. Valid ids are always positive.
pub type EntityId = i64;

/// Value used where an entity id is required but none applies.
pub const INVALID_ENTITY_ID: EntityId = 0;
