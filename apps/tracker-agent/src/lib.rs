//! Headless tracker client: one match session driven from stdin.

pub mod command;
pub mod config;
