pub mod app_url;
pub mod assets;
pub mod booster;
pub mod commands;
pub mod config;
pub mod context;
pub mod database;
pub mod fetch;
pub mod graph;
pub mod models;
pub mod trainer;
