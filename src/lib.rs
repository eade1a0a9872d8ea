pub mod app;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod ownership;
pub mod projector;
pub mod store;
pub mod types;
