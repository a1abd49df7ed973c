#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod api;
pub mod constants;
pub mod db;
pub mod emitter;
pub mod extract;
pub mod fallback;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod redaction;
pub mod sandbox;
pub mod specs;
pub mod sse;
pub mod str_utils;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
