pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod policy;
pub mod service;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;
