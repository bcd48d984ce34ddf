//! Stock tracker watchlist service.
//!
//! A thin host around `st-telemetry`: the routes in [`api`], the
//! instrumented in-memory [`store`] and the upstream [`market`] client all
//! report through the telemetry facades built at startup.

pub mod api;
pub mod config;
pub mod market;
pub mod store;
