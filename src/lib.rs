pub mod app;
pub mod config;
pub mod db;
pub mod events;
pub mod export;
pub mod geo;
pub mod logging;
pub mod models;
pub mod movement;
pub mod scoring;
pub mod store;
pub mod validator;
