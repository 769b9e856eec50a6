//! Conversational web-search assistant: a streaming tool-calling turn loop
//! served over server-sent events.

pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod service;
pub mod tools;
