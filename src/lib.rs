//! Mempool transaction monitor with tracked-contract threat detection.
//!
//! Raw pending transactions enter through a [`FeedHandle`], are normalized,
//! scored by the heuristics in [`signals`] when they touch a tracked
//! contract, folded into rolling [`stats`], and fanned out to subscribers
//! by the [`dispatch`] layer.

pub mod api;
pub mod config;
pub mod core;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod feed;
pub mod notifications;
pub mod registry;
pub mod signals;
pub mod stats;

pub use engine::{Engine, FeedHandle, Health};
pub use error::{EngineError, Result};
