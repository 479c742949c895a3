// ABOUTME: Root library module for the hookwire service binary
// ABOUTME: HTTP API, facade client, action executors, logging and CLI on top of hookwire-core

pub mod api;
pub mod cli;
pub mod executor;
pub mod facade_http;
pub mod logging;
pub mod server;

// Core modules the binary uses directly
pub use hookwire_core::{config, metrics, paths};
