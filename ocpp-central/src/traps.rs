//! Event traps
//!
//! A trap is a caller's declaration that it wants to see the next
//! notification of some type. The connection loop offers every notification
//! it handles; only trapped types are buffered. Callers block on the buffer
//! with a timeout.
//!
//! The awaited set and the buffer sit behind one lock, so a notification is
//! either offered before a wait removes its trap or after, never in between.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::ocpp::Notification;

#[derive(Debug, Default)]
struct TrapState {
    awaited: HashSet<String>,
    queue: VecDeque<Notification>,
}

/// Trapped notification buffer shared by the dispatch loop and callers
#[derive(Debug, Default)]
pub struct EventTraps {
    state: Mutex<TrapState>,
    arrived: Condvar,
}

impl EventTraps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start trapping `name`; arming twice is a no-op
    pub fn arm(&self, name: &str) {
        let mut state = self.state.lock();
        if !state.awaited.contains(name) {
            state.awaited.insert(name.to_string());
        }
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.state.lock().awaited.contains(name)
    }

    /// Names currently trapped, sorted
    pub fn armed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().awaited.iter().cloned().collect();
        names.sort();
        names
    }

    /// Buffer `notification` if its type is trapped
    ///
    /// Returns whether it was buffered.
    pub fn offer(&self, notification: Notification) -> bool {
        let mut state = self.state.lock();
        if !state.awaited.contains(notification.name()) {
            return false;
        }
        state.queue.push_back(notification);
        drop(state);
        self.arrived.notify_all();
        true
    }

    /// Wait up to `timeout` for a buffered notification
    ///
    /// With a name, the name is armed first and the oldest buffered
    /// notification of that type is taken; entries of other types stay
    /// buffered in order. On success the trap is removed. Without a name the
    /// oldest entry of any type is taken and the awaited set is left alone.
    /// On timeout the awaited set keeps whatever was armed. A timeout too
    /// large to represent waits without a deadline.
    pub fn wait(&self, name: Option<&str>, timeout: Duration) -> Result<Notification> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        if let Some(name) = name {
            if !state.awaited.contains(name) {
                state.awaited.insert(name.to_string());
            }
        }

        loop {
            let position = state
                .queue
                .iter()
                .position(|n| name.map_or(true, |name| n.name() == name));

            if let Some(notification) = position.and_then(|i| state.queue.remove(i)) {
                if let Some(name) = name {
                    state.awaited.remove(name);
                }
                return Ok(notification);
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(Error::Timeout(name.unwrap_or("any trapped message").to_string()));
                }
                Some(deadline) => {
                    self.arrived.wait_until(&mut state, deadline);
                }
                None => self.arrived.wait(&mut state),
            }
        }
    }

    /// Drop every buffered notification; traps stay armed
    pub fn clear(&self) {
        self.state.lock().queue.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{
        BootNotificationRequest, ChargePointErrorCode, ChargePointStatus, HeartbeatRequest,
        StatusNotificationRequest,
    };
    use std::sync::Arc;
    use std::thread;

    fn heartbeat() -> Notification {
        Notification::Heartbeat(HeartbeatRequest {})
    }

    fn status(connector_id: i32) -> Notification {
        Notification::StatusNotification(StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            status: ChargePointStatus::Available,
            info: None,
            timestamp: None,
            vendor_id: None,
            vendor_error_code: None,
        })
    }

    #[test]
    fn test_untrapped_notifications_are_dropped() {
        let traps = EventTraps::new();
        assert!(!traps.offer(heartbeat()));
        assert!(traps.is_empty());

        let err = traps.wait(Some("Heartbeat"), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // The trap armed by the failed wait stays in place.
        assert!(traps.is_armed("Heartbeat"));
    }

    #[test]
    fn test_wait_consumes_and_disarms() {
        let traps = EventTraps::new();
        traps.arm("Heartbeat");
        traps.arm("Heartbeat");
        assert_eq!(traps.armed(), vec!["Heartbeat".to_string()]);

        assert!(traps.offer(heartbeat()));
        let msg = traps.wait(Some("Heartbeat"), Duration::from_secs(1)).unwrap();
        assert_eq!(msg, heartbeat());
        assert!(!traps.is_armed("Heartbeat"));

        assert!(!traps.offer(heartbeat()));
        assert!(traps.wait(Some("Heartbeat"), Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_unnamed_wait_takes_head_and_keeps_traps() {
        let traps = EventTraps::new();
        traps.arm("Heartbeat");
        traps.offer(heartbeat());

        let msg = traps.wait(None, Duration::from_secs(1)).unwrap();
        assert_eq!(msg.name(), "Heartbeat");
        assert!(traps.is_armed("Heartbeat"));
    }

    #[test]
    fn test_unnamed_wait_times_out_without_traps() {
        let traps = EventTraps::new();
        let started = Instant::now();
        let err = traps.wait(None, Duration::from_millis(100)).unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(traps.armed().is_empty());
    }

    #[test]
    fn test_named_wait_skips_other_types() {
        let traps = EventTraps::new();
        traps.arm("StatusNotification");
        traps.arm("Heartbeat");

        traps.offer(status(1));
        traps.offer(heartbeat());
        traps.offer(status(2));

        assert_eq!(traps.wait(Some("Heartbeat"), Duration::ZERO).unwrap(), heartbeat());
        assert_eq!(traps.wait(Some("StatusNotification"), Duration::ZERO).unwrap(), status(1));
        assert_eq!(traps.len(), 1);
        assert!(traps.wait(Some("BootNotification"), Duration::ZERO).is_err());
    }

    #[test]
    fn test_wait_with_unbounded_timeout() {
        let traps = Arc::new(EventTraps::new());
        traps.arm("Heartbeat");
        traps.offer(heartbeat());
        assert_eq!(traps.wait(Some("Heartbeat"), Duration::MAX).unwrap(), heartbeat());

        traps.arm("StatusNotification");
        let producer = {
            let traps = traps.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                traps.offer(status(3))
            })
        };
        assert_eq!(traps.wait(None, Duration::MAX).unwrap(), status(3));
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_clear_keeps_traps() {
        let traps = EventTraps::new();
        traps.arm("Heartbeat");
        traps.offer(heartbeat());
        traps.offer(heartbeat());

        traps.clear();
        assert!(traps.is_empty());
        assert!(traps.is_armed("Heartbeat"));
    }

    #[test]
    fn test_wait_wakes_on_offer_from_other_thread() {
        let traps = Arc::new(EventTraps::new());
        traps.arm("BootNotification");

        let producer = {
            let traps = traps.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                traps.offer(Notification::BootNotification(BootNotificationRequest {
                    charge_point_vendor: "Charge Amps".into(),
                    charge_point_model: "Halo".into(),
                    charge_point_serial_number: None,
                    charge_box_serial_number: None,
                    firmware_version: None,
                    iccid: None,
                    imsi: None,
                    meter_type: None,
                    meter_serial_number: None,
                }))
            })
        };

        let msg = traps.wait(Some("BootNotification"), Duration::from_secs(5)).unwrap();
        assert_eq!(msg.name(), "BootNotification");
        assert!(producer.join().unwrap());
    }
}
