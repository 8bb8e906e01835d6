//! Core types for the iopmesh agent substrate.
//!
//! This crate defines the data model shared by the wire protocol and the
//! kernel: typed IOP values, agent definitions, mapping documents, engine
//! events, configuration and the error taxonomy. It contains no business logic.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod iop;
pub mod mapping;
pub mod peer;
