//! Library entry point for the crpy CLI.

pub mod archive;
pub mod auth;
pub mod cache;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod model;
pub mod reference;
pub mod registry;
pub mod utils;
