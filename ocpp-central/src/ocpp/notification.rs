//! Decoded charge point notifications

use serde_json::Value;

use super::messages::{Action, OcppError};
use super::types::*;

/// A notification received from a charge point, decoded by action
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BootNotification(BootNotificationRequest),
    Heartbeat(HeartbeatRequest),
    StatusNotification(StatusNotificationRequest),
    MeterValues(MeterValuesRequest),
    DiagnosticsStatusNotification(DiagnosticsStatusNotificationRequest),
    FirmwareStatusNotification(FirmwareStatusNotificationRequest),
}

impl Notification {
    /// Decode the payload of an inbound CALL
    ///
    /// Fails with `UnknownAction` for actions that are not charge point
    /// notifications, including central system commands.
    pub fn decode(action: &str, payload: Value) -> Result<Self, OcppError> {
        let notification = match action.parse::<Action>()? {
            Action::BootNotification => {
                Notification::BootNotification(serde_json::from_value(payload)?)
            }
            Action::Heartbeat => Notification::Heartbeat(serde_json::from_value(payload)?),
            Action::StatusNotification => {
                Notification::StatusNotification(serde_json::from_value(payload)?)
            }
            Action::MeterValues => Notification::MeterValues(serde_json::from_value(payload)?),
            Action::DiagnosticsStatusNotification => {
                Notification::DiagnosticsStatusNotification(serde_json::from_value(payload)?)
            }
            Action::FirmwareStatusNotification => {
                Notification::FirmwareStatusNotification(serde_json::from_value(payload)?)
            }
            Action::TriggerMessage | Action::GetConfiguration | Action::ChangeConfiguration => {
                return Err(OcppError::UnknownAction(action.to_string()));
            }
        };
        Ok(notification)
    }

    /// The action this notification arrived as
    pub fn action(&self) -> Action {
        match self {
            Notification::BootNotification(_) => Action::BootNotification,
            Notification::Heartbeat(_) => Action::Heartbeat,
            Notification::StatusNotification(_) => Action::StatusNotification,
            Notification::MeterValues(_) => Action::MeterValues,
            Notification::DiagnosticsStatusNotification(_) => Action::DiagnosticsStatusNotification,
            Notification::FirmwareStatusNotification(_) => Action::FirmwareStatusNotification,
        }
    }

    pub fn name(&self) -> &'static str {
        self.action().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_status_notification() {
        let payload = json!({
            "connectorId": 1,
            "errorCode": "NoError",
            "status": "Charging"
        });

        let notification = Notification::decode("StatusNotification", payload).unwrap();
        assert_eq!(notification.name(), "StatusNotification");
        match notification {
            Notification::StatusNotification(req) => {
                assert_eq!(req.connector_id, 1);
                assert_eq!(req.status, ChargePointStatus::Charging);
            }
            other => panic!("Expected StatusNotification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_commands_and_bad_payloads() {
        assert!(matches!(
            Notification::decode("TriggerMessage", json!({"requestedMessage": "Heartbeat"})),
            Err(OcppError::UnknownAction(_))
        ));
        assert!(matches!(
            Notification::decode("Authorize", json!({"idTag": "ABC"})),
            Err(OcppError::UnknownAction(_))
        ));
        assert!(matches!(
            Notification::decode("BootNotification", json!({"chargePointVendor": 3})),
            Err(OcppError::JsonError(_))
        ));
    }
}
