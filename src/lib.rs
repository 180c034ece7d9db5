//! kindling: a serverless backend framework — a runtime and dispatch core
//! that multiplexes HTTP requests, WebSocket events, and queue messages
//! onto handler modules registered at compile time (SPEC_FULL.md §2).
//!
//! Handlers are ordinary `async fn`s annotated with `#[get]`/`#[post]`/…,
//! `#[queue(...)]`, or `#[websocket(...)]`; each attribute drops a
//! registration record into a `linkme::distributed_slice`. At startup,
//! [`manifest::Services::build`] walks those records into the immutable
//! [`manifest::Services`] table, then a host adapter feeds typed events
//! into [`http_engine::dispatch`], [`websocket::dispatch`], or
//! [`queue::dispatch_batch`].

pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod http_engine;
pub mod manifest;
pub mod middleware;
pub mod path;
pub mod queue;
pub mod request;
pub mod response;
pub mod warmup;
pub mod websocket;

#[cfg(feature = "testing")]
pub mod testing;

pub use error::{Error, Result};

pub use kindling_macros::{del, get, middleware, options, patch, post, put, queue, route, warmup, websocket};

/// Re-exported so `kindling_macros`' expansions can refer to
/// `::kindling::linkme::distributed_slice` without requiring downstream
/// crates to depend on `linkme` directly.
pub use linkme;
/// Re-exported for the same reason: handler signatures and macro
/// expansions speak in `serde_json::Value`.
pub use serde_json;
