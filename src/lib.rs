//! # DX Relay - Update Relay and Connection Sync Engine
//!
//! Pairs objects in two collaborating applications (a source and a target)
//! and relays selection and value changes between them through a durable
//! SQLite-backed queue. Clients poll; the relay never pushes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dx_relay::{AppType, HealthConfig, Relay};
//!
//! fn main() -> dx_relay::Result<()> {
//!     let relay = Relay::in_memory(HealthConfig::default())?;
//!     relay.register(AppType::SourceApp, None, None)?;
//!     relay.broadcast_selection(AppType::SourceApp, "Sheet1!A1".into(), None)?;
//!
//!     let updates = relay.updates_for(AppType::TargetApp, None, None)?;
//!     let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
//!     relay.acknowledge(&ids)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod model;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use config::{HealthConfig, PollConfig, RelayConfig};
pub use error::{ErrorKind, RelayError, Result};
pub use health::{HealthMonitor, HealthSnapshot, ReapReport};
pub use model::{AppState, AppType, Connection, ConnectionStatus, Update, UpdateType};
pub use relay::Relay;
pub use storage::Database;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
