//! `previewd` HTTP server.
//!
//! Wires the core orchestration library and provider adapter into a
//! running Axum server: the Control API (C9) of spec §4.9.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
