//! attribflow: chunked pageview indexing and multi-signal conversion attribution
//!
//! - [`store`]: the key-value command interface and its backends
//! - [`pipeline`]: the resumable batch index job
//! - [`attribution`]: matching, journeys and the journey cache
//! - [`api`]: JSON shapes for the job trigger and attribution queries

pub mod api;
pub mod attribution;
pub mod config;
pub mod pipeline;
pub mod store;
