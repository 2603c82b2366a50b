pub mod auth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod realtime;
pub mod reaper;
pub mod store;
pub mod wal;
