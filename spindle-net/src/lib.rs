//! This library provides the networking building blocks for `spindle`
//! simulations.
//!
//! The central construct is the [`WorkerConnection`], which owns the link
//! between a single simulation worker and a deployment's runtime. A worker
//! connects either directly to the runtime's *receptionist* endpoint, or
//! indirectly through an authenticated *locator* service which resolves the
//! deployment to connect to.
//!
//! # Connection lifecycle
//!
//! Connecting is asynchronous. [`WorkerConnection::connect`] returns right
//! away, while the session is established on a transport thread. Exactly one
//! of two outcomes is eventually reported for every attempt: either the
//! worker is connected, or the attempt failed with a [`ConnectionStatusCode`]
//! and a message. Outcomes can be observed through callbacks registered
//! before connecting, or through the returned [`ConnectFuture`].
//!
//! Once connected, the worker sends requests (reserving entity ids, creating
//! and deleting entities, updating components, sending commands, etc.) and
//! polls for the operations produced in response using
//! [`WorkerConnection::get_op_list`].
//!
//! # Local deployments
//!
//! To make it possible to exercise workers without any external
//! infrastructure this library also includes the [`Runtime`] and
//! [`LocatorService`] constructs, which can be started together as a local
//! [`Deployment`].
//!
//! # Testing
//!
//! The [`latent`] module provides a cooperative, tick-driven command queue.
//! It's meant for driving connection scenarios from an external loop without
//! blocking on any single step.
//!
//! [`WorkerConnection`]: connection/struct.WorkerConnection.html
//! [`WorkerConnection::connect`]: connection/struct.WorkerConnection.html#method.connect
//! [`WorkerConnection::get_op_list`]: connection/struct.WorkerConnection.html#method.get_op_list
//! [`ConnectionStatusCode`]: msg/enum.ConnectionStatusCode.html
//! [`ConnectFuture`]: promise/struct.ConnectFuture.html
//! [`Runtime`]: runtime/struct.Runtime.html
//! [`LocatorService`]: locator/struct.LocatorService.html
//! [`Deployment`]: deployment/struct.Deployment.html
//! [`latent`]: latent/index.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

pub mod config;
pub mod connection;
pub mod deployment;
pub mod latent;
pub mod lifecycle;
pub mod locator;
pub mod msg;
pub mod promise;
pub mod runtime;
pub mod socket;

mod error;
mod util;

pub use config::{
    ConnectionConfig, ConnectionParams, ConnectionSetup, LocatorConfig, ReceptionistConfig,
    WorkerRole, WorkerUrl,
};
pub use connection::WorkerConnection;
pub use deployment::{Deployment, DeploymentConfig, DeploymentState};
pub use lifecycle::Lifecycle;
pub use locator::{LocatorService, LocatorServiceConfig};
pub use msg::ConnectionStatusCode;
pub use promise::{ConnectFuture, ConnectOutcome};
pub use runtime::{Runtime, RuntimeConfig, RuntimeStatus};
pub use socket::{Encoding, Socket, SocketConfig, SocketEvent, SocketEventType};

pub use error::{Error, Result};

/// Re-export of the core data model.
pub use spindle_core;
