pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod gates;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod positions;
pub mod server;
