//! orgrbac operator: controllers wiring the engines to the cluster

#![deny(missing_docs)]

pub mod context;
pub mod controller;
pub mod controller_runner;

pub use context::Context;
