pub mod assets;
pub mod config;
pub mod database;
pub mod errors;
pub mod models;
pub mod storage;
pub mod streaming;
pub mod web;
