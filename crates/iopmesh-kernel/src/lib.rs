//! Core engine for the iopmesh agent substrate.
//!
//! One [`agent::Agent`] owns the local IOPs, the active definition, the
//! mapping table, the directory of peers, the subscription channels and the
//! quota guard. [`node::AgentNode`] runs it over the TCP wire protocol and
//! publishes its events on an [`event_bus::EventBus`].

pub mod agent;
pub mod config;
pub mod definition;
pub mod directory;
pub mod error;
pub mod event_bus;
pub mod iop;
pub mod mapping;
pub mod network;
pub mod node;
pub mod quota;

pub use agent::Agent;
pub use error::{KernelError, KernelResult};
pub use node::{AgentNode, WireTransport};
