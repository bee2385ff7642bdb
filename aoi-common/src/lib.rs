//! # AOI Common Library
//!
//! Shared code for the AOI inference agent and its tools:
//! - Error type used across crates
//! - TOML/environment configuration loading
//! - Database initialization and persisted record types
//! - Timestamp and identifier helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;
pub mod uuid_utils;

pub use db::models::DefectCategory;
pub use error::{Error, Result};
