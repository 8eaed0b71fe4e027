//! inarbit backend library.
//!
//! Arbitrage decision and execution core: market data ingest, triangular and
//! cash-and-carry scanners, regime-aware decisioning, and a two-mode
//! (paper/live) order management service over a KV + relational substrate.

pub mod config;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod marketdata;
pub mod models;
pub mod oms;
pub mod regime;
pub mod scanners;
pub mod store;
pub mod util;
