//! Cross-exchange funding-rate arbitrage engine.
//!
//! `runtime::Runtime` is the process-wide facade every collaborator is
//! wired through; `api::http::router` is the thin HTTP layer in front of it.

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod middleware;
pub mod monitor;
pub mod normalize;
pub mod runtime;
pub mod store;
pub mod tracker;
pub mod ws;
