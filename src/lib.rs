pub mod catalog;
pub mod config;
pub mod db;
pub mod fetch;
pub mod jsonapi;
pub mod lock;
pub mod mapping;
pub mod model;
pub mod references;
pub mod resolve;
pub mod server;
pub mod sync;
