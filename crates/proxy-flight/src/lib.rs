//! # proxy-flight
//!
//! Concurrency coordination in front of a slow, expensive load (a proxy
//! lookup, a network fetch) keyed by a string identifier:
//!
//! - **Request collapsing** — concurrent callers asking for the same key
//!   share one underlying load and all observe the same result.
//! - **Concurrency throttling** — the number of loads running at any
//!   instant is capped; excess callers wait for a slot.
//!
//! Nothing is cached: a result lives only as long as callers are
//! collapsed onto it. Failed loads are not retried; a `false` success
//! flag is delivered to every collapsed caller as-is.
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use proxy_flight::{Loader, ProxyLoad};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ProxyLoad for Echo {
//!     async fn load(&self, key: &str) -> (Bytes, bool) {
//!         (Bytes::from(key.to_owned()), true)
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let loader = Loader::new(Arc::new(Echo), 4);
//! let (value, ok) = loader.load("proxy-a").await;
//! assert!(ok);
//! assert_eq!(value, Bytes::from("proxy-a"));
//! # }
//! ```

#![cfg_attr(test, allow(clippy::panic, clippy::unwrap_used))]

pub mod gate;
pub mod loader;

pub use gate::{Gate, GatePermit, GateStatus};
pub use loader::{Loader, LoaderStatus, ProxyLoad};
