//! Command implementations by domain.

pub mod config;
pub mod definition;
pub mod mapping;
pub mod run;
