//! # Spacepark Docking Server
//!
//! Coordinates landing-pad allocation for spacecraft. Clients ask for a free
//! pad, dock, and undock with a parking fee over a fixed-layout binary
//! protocol on TCP.
//!
//! ## Quick Start
//!
//! ```rust
//! use spacepark::{DockAllocator, SqliteLedger};
//!
//! let ledger = SqliteLedger::open_in_memory().unwrap();
//! let terminal = ledger.add_terminal("Alpha").unwrap();
//! let pad = ledger.add_pad(terminal, 20.0, 15, 50).unwrap();
//!
//! let allocator = DockAllocator::new(ledger);
//! assert_eq!(allocator.find_free_dock(10.0).unwrap(), Some(pad));
//!
//! allocator.dock(pad, 10.0, "NCC-1701").unwrap();
//! assert_eq!(allocator.find_free_dock(10.0).unwrap(), None);
//! ```
//!
//! ## Architecture
//!
//! - [`server`] - Connection multiplexer and per-connection sessions
//! - [`protocol`] - Wire codec and frame buffering
//! - [`dispatch`] - Request to allocator mapping
//! - [`allocator`] - Dock allocation and fee computation
//! - [`ledger`] - Store interface and SQLite adapter
//! - [`client`] - Async protocol client
//! - [`config`] - TOML server configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod allocator;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod ledger;
pub mod protocol;
pub mod server;

// Re-export main public types for convenience
pub use allocator::{compute_fee, DockAllocator, DockError};
pub use client::DockClient;
pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use ledger::{LedgerStore, SqliteLedger};
pub use protocol::{Frame, Message, Status};
pub use server::DockServer;
