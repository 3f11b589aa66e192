//! Gator - A command-line RSS aggregator
//!
//! Users register, follow feeds and browse the posts that the `agg` loop
//! scrapes into a shared SQLite database.

pub mod aggregator;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;

pub use error::{Error, Result};
