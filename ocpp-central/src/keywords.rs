//! Keyword-style facade for test suites
//!
//! Thin synchronous wrappers over [`CentralSystem`] and [`Session`] with the
//! argument shapes test-framework keywords use: station ids and message names
//! as strings, values as text, generic message templates as JSON.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::config::KeywordsConfig;
use crate::error::{Error, Result};
use crate::ocpp::{Notification, TriggerMessageResponse};
use crate::registry::CentralSystem;
use crate::session::{Session, LIGHT_INTENSITY};

/// One instance per test suite
pub struct Keywords {
    config: KeywordsConfig,
    central_system: CentralSystem,
}

impl Keywords {
    pub fn new(config: KeywordsConfig) -> Self {
        let central_system = CentralSystem::new(config.central_system.clone());
        Self { config, central_system }
    }

    pub fn central_system(&self) -> &CentralSystem {
        &self.central_system
    }

    fn session(&self, cp: &str) -> Result<Arc<Session>> {
        self.central_system.find_session(cp)
    }

    /// Start the central system; restarting on the same address is a no-op
    pub fn start_central_system(&self, addr: &str, port: u16) -> Result<()> {
        if self.central_system.serving_on(addr, port) {
            return Ok(());
        }
        self.central_system.serve(addr, port)?;
        Ok(())
    }

    /// Wait for the next charge point and let its start-up traffic settle
    pub fn wait_for_charge_point_to_connect(&self) -> String {
        let cp = self.central_system.wait_for_connection();
        info!("Charge point {} connected", cp);
        thread::sleep(self.config.settle_delay);
        cp
    }

    pub fn disconnect_central_system(&self) -> Result<()> {
        self.central_system.shutdown()
    }

    pub fn send_trigger_message(&self, cp: &str, msg: &str) -> Result<TriggerMessageResponse> {
        self.session(cp)?.trigger_message(msg)
    }

    pub fn clear_msg_queue(&self, cp: &str) -> Result<()> {
        self.session(cp)?.clear_queue();
        Ok(())
    }

    /// Wait for a trapped message using the configured timeout
    pub fn wait_for_msg(&self, cp: &str, msg: Option<&str>) -> Result<Notification> {
        self.wait_for_msg_timeout(cp, msg, self.config.wait_timeout)
    }

    pub fn wait_for_msg_timeout(
        &self,
        cp: &str,
        msg: Option<&str>,
        timeout: Duration,
    ) -> Result<Notification> {
        self.session(cp)?.wait_message(msg, timeout)
    }

    pub fn add_msg_trap(&self, cp: &str, msg: &str) -> Result<()> {
        self.session(cp)?.add_trap(msg);
        Ok(())
    }

    pub fn set_light_intensity(&self, cp: &str, intensity: &str) -> Result<()> {
        let percent: i64 = intensity.trim().parse().map_err(|_| Error::Validation {
            key: LIGHT_INTENSITY.to_string(),
            reason: format!("{:?} is not an integer", intensity),
        })?;
        self.session(cp)?.set_light_intensity(percent)
    }

    /// Current light intensity, or -1 when the charge point cannot be read
    ///
    /// An unknown charge point is still an error.
    pub fn get_light_intensity(&self, cp: &str) -> Result<i64> {
        let session = self.session(cp)?;
        match session.light_intensity() {
            Ok(value) => Ok(value),
            Err(e) => {
                error!("Reading light intensity of {} failed: {}", cp, e);
                Ok(-1)
            }
        }
    }
}

impl Default for Keywords {
    fn default() -> Self {
        Self::new(KeywordsConfig::default())
    }
}

/// Empty message template: `{"type": <msg_type>, "payload": {}}`
pub fn create_message(msg_type: &str) -> Value {
    json!({ "type": msg_type, "payload": {} })
}

/// Set `field` in the message payload
///
/// `field` is a dotted path; missing or non-object intermediate entries are
/// replaced by objects.
pub fn set_message_field(msg: &mut Value, field: &str, value: Value) -> Result<()> {
    let invalid = |reason: &str| Error::Validation {
        key: field.to_string(),
        reason: reason.to_string(),
    };

    let mut path: Vec<&str> = field.split('.').collect();
    if path.iter().any(|segment| segment.is_empty()) {
        return Err(invalid("empty path segment"));
    }
    let last = path.pop().ok_or_else(|| invalid("empty path"))?;

    let Some(root) = msg.as_object_mut() else {
        return Err(invalid("message is not an object"));
    };

    let mut node = object_entry(root, "payload").ok_or_else(|| invalid("bad payload"))?;
    for segment in path {
        node = object_entry(node, segment).ok_or_else(|| invalid("bad path segment"))?;
    }
    node.insert(last.to_string(), value);
    Ok(())
}

/// Object stored under `key`, created or replaced as needed
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    let entry = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut()
}
