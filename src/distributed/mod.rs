//! Distributed mode implementation
//!
//! Searches can borrow CPUs from other machines running a permuter server.
//!
//! # Architecture
//!
//! - **Client** (`client`): each connected server becomes one executor on
//!   the coordinator's task queue, indistinguishable from a local worker
//! - **Node Service** (`node_service`): runs on servers, evaluates requested
//!   seeds on a shared thread pool and streams results back
//! - **Protocol** (`protocol`): message definitions and framing
//!
//! Servers receive every target's [`TargetSpec`](crate::eval::TargetSpec), so
//! they never need access to the client's files.

pub mod client;
pub mod node_service;
pub mod protocol;

pub use client::{vouch, RemotePool};
pub use node_service::{NodeService, ServiceSettings};
pub use protocol::{Message, PROTOCOL_VERSION};
