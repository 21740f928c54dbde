//! Configuration and the record model shared by every layer

pub mod config;
pub mod models;
