//! # torkeeper core library
//!
//! Keeps a local Tor client alive on behalf of an application: launches Tor
//! once, drives it over the ControlPort, reports bootstrap progress, and
//! nudges it when bootstrapping stalls or the network changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        lifecycle (OnionManager)         │
//! ├──────────────┬──────────────┬───────────┤
//! │   bridges    │ reachability │ settings  │
//! ├──────────────┴──────────────┴───────────┤
//! │  tor: process · controller · transport  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use torkeeper_core::{ManagerConfig, MemorySettingsStore, OnionManager};
//!
//! # async fn run() -> torkeeper_core::Result<()> {
//! let manager = OnionManager::new(
//!     ManagerConfig::with_data_dir("/var/lib/torkeeper"),
//!     &MemorySettingsStore::default(),
//! )?;
//! let mut events = manager.start().await?;
//! while let Some(progress) = events.progress.recv().await {
//!     println!("bootstrapped {progress}%");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bridges;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod reachability;
pub mod settings;
pub mod tor;

pub use bridges::{BridgeConfiguration, BridgesType};
pub use config::{ManagerConfig, TransportConfig};
pub use error::{Error, OnionErrorKind, Result};
pub use lifecycle::{ConnectionEvents, LifecycleState, ManagerBuilder, OnionEvent, OnionManager};
pub use settings::{BridgeSettingsStore, JsonSettingsStore, MemorySettingsStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
