//! # OCPP Central
//!
//! OCPP 1.6-J central system stand-in for charging station test harnesses.
//!
//! Charge points connect over WebSocket; test drivers, running on ordinary
//! threads, look up a charge point's [`Session`], send it commands and block
//! until it answers, or arm traps and wait for the notifications it sends on
//! its own.
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ ws://addr:port/<stationId>  (ocpp1.6)
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │  central-system thread (tokio runtime)   │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │ accept loop  │──►│ Connection::run │  │
//! │  └──────────────┘   └────────┬────────┘  │
//! └──────────────────────────────┼───────────┘
//!            CallBridge ▲        │ Session::dispatch
//!                       │        ▼
//! ┌──────────────────────────────────────────┐
//! │  test driver threads                     │
//! │  CentralSystem │ Session │ EventTraps    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use ocpp_central::{CentralSystem, CentralSystemConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = CentralSystem::new(CentralSystemConfig::default());
//!     system.serve("0.0.0.0", 9000)?;
//!
//!     let cp = system.wait_for_connection();
//!     let session = system.find_session(&cp)?;
//!
//!     session.add_trap("Heartbeat");
//!     session.trigger_message("Heartbeat")?;
//!     session.wait_message(Some("Heartbeat"), Duration::from_secs(1))?;
//!
//!     session.set_light_intensity(80)?;
//!     assert_eq!(session.light_intensity()?, 80);
//!
//!     system.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod error;
pub mod traps;
pub mod connection;
pub mod bridge;
pub mod session;
pub mod transport;
pub mod registry;
pub mod keywords;

pub use config::{CentralSystemConfig, KeywordsConfig};
pub use error::{Error, Result};
pub use bridge::{BlockingCall, CallBridge};
pub use session::Session;
pub use registry::CentralSystem;
pub use keywords::{create_message, set_message_field, Keywords};
pub use traps::EventTraps;

// Re-export key types
pub use ocpp::{Action, MessageTrigger, Notification, OcppError};
