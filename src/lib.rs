// src/lib.rs

pub mod api;
pub mod app_state;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod objects;
pub mod retry;
pub mod store;
