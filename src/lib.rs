pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod events;
pub mod location;
pub mod logging;
pub mod marker;
pub mod models;
pub mod server;
pub mod tracker;
pub mod ui;
