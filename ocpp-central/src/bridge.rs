//! Blocking calls into the central system runtime
//!
//! Test drivers run on ordinary threads while every station connection lives
//! on the central system's runtime. A [`CallBridge`] submits a request to the
//! station's connection task and parks the calling thread on a oneshot
//! channel until the matched response, the response timeout or a connection
//! error comes back. The runtime itself is never blocked.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ocpp::{Action, Call, OcppError};

/// Synchronous request/response against a charge point
pub trait BlockingCall: Send + Sync {
    /// Send `action` with `payload` and block until the charge point answers
    fn blocking_call(&self, action: Action, payload: Value) -> Result<Value>;
}

/// Bridge between caller threads and one station's connection task
///
/// One call at a time: a second caller arriving while a call is in flight
/// gets `ConcurrentCall` instead of queueing behind it.
pub struct CallBridge {
    connection: Connection,
    runtime: Handle,
    in_flight: AtomicBool,
}

impl CallBridge {
    pub fn new(connection: Connection, runtime: Handle) -> Self {
        Self {
            connection,
            runtime,
            in_flight: AtomicBool::new(false),
        }
    }
}

impl BlockingCall for CallBridge {
    fn blocking_call(&self, action: Action, payload: Value) -> Result<Value> {
        // Parking a runtime thread on its own work would never wake up.
        if Handle::try_current().is_ok() {
            return Err(Error::CalledFromRuntime);
        }

        let _slot = InFlight::acquire(&self.in_flight)
            .ok_or_else(|| Error::ConcurrentCall(self.connection.station_id().to_string()))?;

        let call = Call::new(action, payload)?;
        debug!(
            "Calling {} on {} ({})",
            action,
            self.connection.station_id(),
            call.message_id
        );

        let (result_tx, result_rx) = oneshot::channel();
        let connection = self.connection.clone();
        self.runtime.spawn(async move {
            let _ = result_tx.send(connection.request(call).await);
        });

        let result = result_rx
            .blocking_recv()
            .map_err(|_| OcppError::ConnectionClosed)??;
        Ok(result.payload)
    }
}

/// Marks the bridge busy for the lifetime of one call
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
