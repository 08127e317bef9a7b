//! Data-freshness and cross-view synchronization for the water and sewerage
//! laboratory portal.

pub mod config;
pub mod datastore;
pub mod domain;
pub mod error;
pub mod infra;
pub mod portal;
pub mod sync;
