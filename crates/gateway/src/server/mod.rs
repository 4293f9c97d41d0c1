//! Axum HTTPS server, routing, and middleware.
//!
//! # Responsibilities
//! - Accept TLS and plaintext connections and serve them with hyper.
//! - Define the Axum router: login, ACME challenges, SPA, backend proxy and
//!   static files, with the Basic-Auth gate where configured.
//! - Wrap every response in the ordered security-header pipeline.

pub mod auth;
pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod spa;
pub mod state;
