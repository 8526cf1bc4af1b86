//! OCPP 1.6-J protocol layer
//!
//! - `types`: payloads exchanged with charge points
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `notification`: decoded charge point notifications

pub mod types;
pub mod messages;
pub mod notification;

pub use types::*;
pub use messages::*;
pub use notification::Notification;
