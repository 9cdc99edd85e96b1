//! panelbridge: reconciliation worker between internal engagement orders and
//! an external SMM panel.
//!
//! The worker forwards accepted orders to the panel, polls their progress,
//! and maps the panel's vocabulary back onto the internal order records.
//! See the module docs for the individual pieces:
//!
//! - [`panel`] - the provider adapter (wire protocol + normalization)
//! - [`store`] - the order store gateway (conditional writes, lifecycle guard)
//! - [`engine`] - the reconciliation engine (submit, poll, sweep)
//! - [`server`] - the HTTP request handler

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orders;
pub mod panel;
pub mod server;
pub mod store;
