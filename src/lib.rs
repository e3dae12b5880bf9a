//! wg-relay - Per-client WireGuard relay routing and split tunneling
//!
//! This crate turns VPN client records into Linux kernel routing state. Each
//! client can be sent straight out, entirely through an upstream relay
//! tunnel, or split between the two by domain/CIDR rules. Every pass is
//! idempotent and tears down whatever a removed or changed client left
//! behind.
//!
//! # Architecture
//!
//! - `model`: Client, relay and split rule records
//! - `wireguard`: Relay config parsing (`import`) and rendering (`render`)
//! - `platform`: Host networking tools behind narrow traits
//! - `routing`: Allocation, relay lifecycle, policy routing, chains, sets
//!   and the reconciliation engine
//! - `state`: Last-applied snapshot for teardown detection
//! - `service`: Serialized async access to the engine
//! - `config`: Configuration file handling (TOML)
//!
//! # Usage
//!
//! From the record store's change hook:
//! ```bash
//! sudo wg-relay sync --records /var/lib/wg-relay/records.json
//! ```

pub mod config;
pub mod model;
pub mod platform;
pub mod routing;
pub mod service;
pub mod state;
pub mod wireguard;

pub use config::Config;
pub use model::RecordSet;
pub use routing::{Reconciler, SyncReport};
pub use service::RoutingService;
pub use state::StateStore;
