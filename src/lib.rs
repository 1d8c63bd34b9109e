pub mod apply;
pub mod cluster;
pub mod config;
pub mod events;
pub mod http_objects;
pub mod manager;
pub mod resources;
pub mod routes;
pub mod service;
pub mod tracing;

pub use manager::{ErrorClass, ServiceError, ServiceManager};

#[cfg(test)]
mod testing;
