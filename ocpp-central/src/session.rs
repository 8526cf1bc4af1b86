//! Charge point session
//!
//! The central system's stand-in for one connected charge point. Inbound
//! notifications go through a fixed dispatch table: every handler logs the
//! payload, offers it to the event traps and returns the acknowledgement the
//! protocol mandates. Outbound operations (trigger, configuration) go through
//! the session's [`BlockingCall`] bridge and are meant for caller threads.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bridge::BlockingCall;
use crate::error::{Error, Result};
use crate::ocpp::*;
use crate::traps::EventTraps;

/// Heartbeat interval handed to booting charge points unless configured
pub const DEFAULT_HEARTBEAT_INTERVAL: i32 = 5;

/// Configuration key of the light ring brightness, in percent
pub const LIGHT_INTENSITY: &str = "LightIntensity";

/// Integer settings with a known valid range
struct BoundedSetting {
    key: &'static str,
    min: i64,
    max: Option<i64>,
}

const BOUNDED_SETTINGS: &[BoundedSetting] = &[
    BoundedSetting { key: LIGHT_INTENSITY, min: 0, max: Some(100) },
    BoundedSetting { key: "HeartbeatInterval", min: 0, max: None },
    BoundedSetting { key: "MeterValueSampleInterval", min: 0, max: None },
];

/// Check `value` against the known range for `key`
///
/// Returns the value to send: bounded settings are sent as the parsed
/// integer, keys without a known range are passed through unchanged.
pub fn validate_setting(key: &str, value: &str) -> Result<String> {
    let Some(setting) = BOUNDED_SETTINGS.iter().find(|s| s.key == key) else {
        return Ok(value.to_string());
    };

    let invalid = |reason: String| Error::Validation {
        key: key.to_string(),
        reason,
    };

    let parsed: i64 = value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{:?} is not an integer", value)))?;

    let out_of_range = parsed < setting.min || setting.max.is_some_and(|max| parsed > max);
    if out_of_range {
        let range = match setting.max {
            Some(max) => format!("{}..={}", setting.min, max),
            None => format!(">= {}", setting.min),
        };
        return Err(invalid(format!("{} out of range {}", parsed, range)));
    }
    Ok(parsed.to_string())
}

/// One connected charge point
pub struct Session {
    id: String,
    bridge: Arc<dyn BlockingCall>,
    traps: EventTraps,
    heartbeat_interval: i32,
}

impl Session {
    pub fn new(id: impl Into<String>, bridge: Arc<dyn BlockingCall>) -> Self {
        Self {
            id: id.into(),
            bridge,
            traps: EventTraps::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn traps(&self) -> &EventTraps {
        &self.traps
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Answer an inbound CALL with a CALLRESULT or CALLERROR
    pub fn dispatch(&self, call: Call) -> OcppMessage {
        let Call { message_id, action, payload } = call;

        match Notification::decode(&action, payload).and_then(|n| self.handle(n)) {
            Ok(ack) => OcppMessage::CallResult(CallResult { message_id, payload: ack }),
            Err(OcppError::UnknownAction(action)) => {
                warn!("{} sent unsupported action {}", self.id, action);
                OcppMessage::CallError(CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("{} is not supported", action),
                ))
            }
            Err(OcppError::JsonError(e)) => {
                warn!("{} sent malformed {}: {}", self.id, action, e);
                OcppMessage::CallError(CallError::new(
                    message_id,
                    ErrorCode::FormationViolation,
                    e.to_string(),
                ))
            }
            Err(e) => OcppMessage::CallError(CallError::new(
                message_id,
                ErrorCode::InternalError,
                e.to_string(),
            )),
        }
    }

    /// Route a decoded notification to its handler
    pub fn handle(&self, notification: Notification) -> Result<Value, OcppError> {
        let ack = match notification {
            Notification::BootNotification(req) => to_ack(self.on_boot_notification(req))?,
            Notification::Heartbeat(req) => to_ack(self.on_heartbeat(req))?,
            Notification::StatusNotification(req) => to_ack(self.on_status_notification(req))?,
            Notification::MeterValues(req) => to_ack(self.on_meter_values(req))?,
            Notification::DiagnosticsStatusNotification(req) => {
                to_ack(self.on_diagnostics_status_notification(req))?
            }
            Notification::FirmwareStatusNotification(req) => {
                to_ack(self.on_firmware_status_notification(req))?
            }
        };
        Ok(ack)
    }

    pub fn on_boot_notification(&self, req: BootNotificationRequest) -> BootNotificationResponse {
        info!("{} => BootNotification {:?}", self.id, req);
        self.trap(Notification::BootNotification(req));

        BootNotificationResponse {
            current_time: Utc::now(),
            interval: self.heartbeat_interval,
            status: RegistrationStatus::Accepted,
        }
    }

    pub fn on_heartbeat(&self, req: HeartbeatRequest) -> HeartbeatResponse {
        info!("{} => Heartbeat", self.id);
        self.trap(Notification::Heartbeat(req));

        HeartbeatResponse {
            current_time: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    pub fn on_status_notification(&self, req: StatusNotificationRequest) -> EmptyResponse {
        info!("{} => StatusNotification {:?}", self.id, req);
        self.trap(Notification::StatusNotification(req));
        EmptyResponse {}
    }

    pub fn on_meter_values(&self, req: MeterValuesRequest) -> EmptyResponse {
        info!("{} => MeterValues {:?}", self.id, req);
        self.trap(Notification::MeterValues(req));
        EmptyResponse {}
    }

    pub fn on_diagnostics_status_notification(
        &self,
        req: DiagnosticsStatusNotificationRequest,
    ) -> EmptyResponse {
        info!("{} => DiagnosticsStatusNotification {:?}", self.id, req);
        self.trap(Notification::DiagnosticsStatusNotification(req));
        EmptyResponse {}
    }

    pub fn on_firmware_status_notification(
        &self,
        req: FirmwareStatusNotificationRequest,
    ) -> EmptyResponse {
        info!("{} => FirmwareStatusNotification {:?}", self.id, req);
        self.trap(Notification::FirmwareStatusNotification(req));
        EmptyResponse {}
    }

    fn trap(&self, notification: Notification) {
        let name = notification.name();
        if self.traps.offer(notification) {
            debug!("{} trapped {}", self.id, name);
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn call<Req, Resp>(&self, action: Action, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(OcppError::from)?;
        let response = self.bridge.blocking_call(action, payload)?;
        Ok(serde_json::from_value(response).map_err(OcppError::from)?)
    }

    /// Ask the charge point to send `message` now
    ///
    /// Only the messages in [`MessageTrigger`] can be requested; anything
    /// else fails before a request goes out.
    pub fn trigger_message(&self, message: &str) -> Result<TriggerMessageResponse> {
        let requested_message: MessageTrigger = message
            .parse()
            .map_err(|_| Error::UnsupportedTrigger(message.to_string()))?;

        info!("{} <= TriggerMessage: {}", self.id, requested_message);
        let response: TriggerMessageResponse = self.call(
            Action::TriggerMessage,
            &TriggerMessageRequest {
                requested_message,
                connector_id: None,
            },
        )?;

        if response.status != TriggerMessageStatus::Accepted {
            return Err(Error::TriggerRejected {
                message: message.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Read one configuration value as reported by the charge point
    pub fn get_config(&self, key: &str) -> Result<String> {
        let read_error = |reason: String| Error::ConfigRead {
            key: key.to_string(),
            reason,
        };

        let request = GetConfigurationRequest {
            key: Some(vec![key.to_string()]),
        };
        let response: GetConfigurationResponse = self
            .call(Action::GetConfiguration, &request)
            .map_err(|e| {
                error!("{} GetConfiguration {} failed: {}", self.id, key, e);
                read_error(e.to_string())
            })?;

        if response.unknown_key.iter().any(|k| k == key) {
            return Err(read_error("unknown key".to_string()));
        }

        response
            .configuration_key
            .into_iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value)
            .ok_or_else(|| read_error("no value reported".to_string()))
    }

    /// Read one configuration value and parse it
    pub fn get_config_as<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get_config(key)?;
        raw.trim().parse().map_err(|e: T::Err| Error::ConfigRead {
            key: key.to_string(),
            reason: format!("{:?}: {}", raw, e),
        })
    }

    /// Change one configuration value
    ///
    /// Known bounded settings are validated before anything is sent.
    pub fn set_config(&self, key: &str, value: &str) -> Result<ChangeConfigurationResponse> {
        let value = validate_setting(key, value)?;

        info!("{} <= ChangeConfiguration {}={}", self.id, key, value);
        let response: ChangeConfigurationResponse = self.call(
            Action::ChangeConfiguration,
            &ChangeConfigurationRequest {
                key: key.to_string(),
                value,
            },
        )?;

        if response.status != ConfigurationStatus::Accepted {
            return Err(Error::ConfigRejected {
                key: key.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }

    pub fn light_intensity(&self) -> Result<i64> {
        self.get_config_as(LIGHT_INTENSITY)
    }

    pub fn set_light_intensity(&self, percent: i64) -> Result<()> {
        self.set_config(LIGHT_INTENSITY, &percent.to_string())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Traps
    // ------------------------------------------------------------------

    pub fn add_trap(&self, name: &str) {
        if name.parse::<MessageTrigger>().is_err() {
            warn!("{} trapping {}, which is not a charge point notification", self.id, name);
        }
        self.traps.arm(name);
    }

    /// Wait for a trapped notification, see [`EventTraps::wait`]
    pub fn wait_message(&self, name: Option<&str>, timeout: Duration) -> Result<Notification> {
        self.traps.wait(name, timeout)
    }

    pub fn clear_queue(&self) {
        self.traps.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("traps", &self.traps)
            .finish_non_exhaustive()
    }
}

fn to_ack(response: impl Serialize) -> Result<Value, OcppError> {
    Ok(serde_json::to_value(response)?)
}
