// Anaplan Sync - library root

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http_client;
pub mod model;
pub mod tasks;
pub mod upload;
