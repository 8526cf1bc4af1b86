//! Per-station connection
//!
//! Runs inside the central system runtime. Owns the station's WebSocket,
//! answers its notifications through the [`Session`] dispatch table and
//! correlates our own CALLs with the CALLRESULT/CALLERROR frames that come
//! back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::CentralSystemConfig;
use crate::ocpp::{Call, CallResult, OcppError, OcppMessage};
use crate::session::Session;

type PendingTable = HashMap<String, oneshot::Sender<Result<CallResult, OcppError>>>;

/// Handle to one station's link; cheap to clone
#[derive(Clone)]
pub struct Connection {
    station_id: String,
    outgoing_tx: mpsc::Sender<OcppMessage>,
    pending: Arc<RwLock<PendingTable>>,
    request_timeout: Duration,
}

impl Connection {
    /// Create a connection handle and the receiver its run loop drains
    pub fn new(
        station_id: impl Into<String>,
        config: &CentralSystemConfig,
    ) -> (Self, mpsc::Receiver<OcppMessage>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_capacity);

        let connection = Self {
            station_id: station_id.into(),
            outgoing_tx,
            pending: Arc::new(RwLock::new(HashMap::new())),
            request_timeout: config.response_timeout,
        };

        (connection, outgoing_rx)
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Send a request to the station and wait for its response
    pub async fn request(&self, call: Call) -> Result<CallResult, OcppError> {
        let (response_tx, response_rx) = oneshot::channel();
        let message_id = call.message_id.clone();

        self.pending.write().await.insert(message_id.clone(), response_tx);

        if self.outgoing_tx.send(OcppMessage::Call(call)).await.is_err() {
            self.pending.write().await.remove(&message_id);
            return Err(OcppError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OcppError::ConnectionClosed),
            Err(_) => {
                self.pending.write().await.remove(&message_id);
                Err(OcppError::Timeout)
            }
        }
    }

    /// Hand a response to whoever is waiting on `message_id`
    ///
    /// Returns false when nothing was waiting.
    pub(crate) async fn resolve(
        &self,
        message_id: &str,
        outcome: Result<CallResult, OcppError>,
    ) -> bool {
        match self.pending.write().await.remove(message_id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Serve the station until its WebSocket closes
    ///
    /// Frames are handled strictly in arrival order. A close frame or end of
    /// stream is a graceful end; transport errors are returned. Either way,
    /// requests still waiting for an answer fail with `ConnectionClosed`.
    pub async fn run<S>(
        &self,
        ws: WebSocketStream<S>,
        session: &Session,
        mut outgoing_rx: mpsc::Receiver<OcppMessage>,
    ) -> Result<(), OcppError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        let result = loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("{} => {}", self.station_id, text);

                            if let Some(reply) = self.handle_frame(text.as_bytes(), session).await {
                                if let Err(e) = send(&mut ws_tx, reply).await {
                                    break Err(e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("Charge point {} closed the connection", self.station_id);
                            break Ok(());
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("Ignoring binary frame from {}", self.station_id);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(e.into());
                        }
                        None => {
                            info!("WebSocket stream from {} ended", self.station_id);
                            break Ok(());
                        }
                    }
                }

                Some(outgoing) = outgoing_rx.recv() => {
                    if let Err(e) = send(&mut ws_tx, outgoing).await {
                        break Err(e);
                    }
                }
            }
        };

        // Dropping the waiters fails their requests with ConnectionClosed.
        self.pending.write().await.clear();
        result
    }

    async fn handle_frame(&self, bytes: &[u8], session: &Session) -> Option<OcppMessage> {
        match OcppMessage::parse(bytes) {
            Ok(OcppMessage::Call(call)) => Some(session.dispatch(call)),
            Ok(OcppMessage::CallResult(result)) => {
                let message_id = result.message_id.clone();
                if !self.resolve(&message_id, Ok(result)).await {
                    warn!("Unmatched CALLRESULT {} from {}", message_id, self.station_id);
                }
                None
            }
            Ok(OcppMessage::CallError(error)) => {
                let message_id = error.message_id.clone();
                let outcome = Err(OcppError::RemoteError {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                });
                if !self.resolve(&message_id, outcome).await {
                    warn!("Unmatched CALLERROR {} from {}", message_id, self.station_id);
                }
                None
            }
            Err(e) => {
                warn!("Failed to parse OCPP message from {}: {}", self.station_id, e);
                None
            }
        }
    }
}

async fn send<S>(
    ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
    msg: OcppMessage,
) -> Result<(), OcppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = match msg.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to serialize message {}: {}", msg.message_id(), e);
            return Ok(());
        }
    };

    let text = String::from_utf8_lossy(&bytes).into_owned();
    debug!("<= {}", text);

    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BlockingCall;
    use crate::error::{Error, Result};
    use crate::ocpp::{Action, ErrorCode, GetConfigurationRequest};
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Offline;

    impl BlockingCall for Offline {
        fn blocking_call(&self, _action: Action, _payload: Value) -> Result<Value> {
            Err(Error::NotRunning)
        }
    }

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, station_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let station = WebSocketStream::from_raw_socket(station_io, Role::Client, None).await;
        (server, station)
    }

    async fn next_frame(station: &mut WebSocketStream<DuplexStream>) -> Value {
        loop {
            match station.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    async fn send_frame(station: &mut WebSocketStream<DuplexStream>, frame: Value) {
        station.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    fn setup() -> (Connection, mpsc::Receiver<OcppMessage>, Arc<Session>) {
        let config = CentralSystemConfig::default().with_response_timeout(Duration::from_secs(2));
        let (connection, outgoing_rx) = Connection::new("CP1", &config);
        let session = Arc::new(Session::new("CP1", Arc::new(Offline)));
        (connection, outgoing_rx, session)
    }

    #[tokio::test]
    async fn test_notifications_are_acknowledged_in_order() {
        let (connection, outgoing_rx, session) = setup();
        let (server, mut station) = ws_pair().await;

        session.add_trap("Heartbeat");
        let runner = {
            let connection = connection.clone();
            let session = session.clone();
            tokio::spawn(async move { connection.run(server, &session, outgoing_rx).await })
        };

        send_frame(&mut station, json!([2, "m1", "Heartbeat", {}])).await;
        send_frame(&mut station, json!([2, "m2", "StatusNotification", {
            "connectorId": 1, "errorCode": "NoError", "status": "Available"
        }])).await;
        send_frame(&mut station, json!([2, "m3", "StartTransaction", {"connectorId": 1}])).await;
        send_frame(&mut station, json!([2, "m4", "BootNotification", {"chargePointVendor": 1}])).await;

        let heartbeat = next_frame(&mut station).await;
        assert_eq!(heartbeat[0], 3);
        assert_eq!(heartbeat[1], "m1");
        assert!(heartbeat[2]["currentTime"].as_str().unwrap().ends_with('Z'));

        assert_eq!(next_frame(&mut station).await, json!([3, "m2", {}]));

        let unknown = next_frame(&mut station).await;
        assert_eq!(unknown[0], 4);
        assert_eq!(unknown[1], "m3");
        assert_eq!(unknown[2], "NotImplemented");

        let malformed = next_frame(&mut station).await;
        assert_eq!(malformed[1], "m4");
        assert_eq!(malformed[2], "FormationViolation");

        assert_eq!(session.traps().len(), 1);

        station.close(None).await.unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_request_is_matched_to_its_response() {
        let (connection, outgoing_rx, session) = setup();
        let (server, mut station) = ws_pair().await;

        let runner = {
            let connection = connection.clone();
            let session = session.clone();
            tokio::spawn(async move { connection.run(server, &session, outgoing_rx).await })
        };

        let call = Call::new(
            Action::GetConfiguration,
            GetConfigurationRequest { key: Some(vec!["LightIntensity".into()]) },
        )
        .unwrap();
        let message_id = call.message_id.clone();
        let request = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(call).await })
        };

        let frame = next_frame(&mut station).await;
        assert_eq!(frame[0], 2);
        assert_eq!(frame[1], message_id.as_str());
        assert_eq!(frame[2], "GetConfiguration");
        assert_eq!(frame[3], json!({"key": ["LightIntensity"]}));

        // A stray response must not satisfy the pending request.
        send_frame(&mut station, json!([3, "someone-else", {}])).await;
        send_frame(&mut station, json!([3, message_id, {
            "configurationKey": [{"key": "LightIntensity", "readonly": false, "value": "70"}]
        }])).await;

        let result = request.await.unwrap().unwrap();
        assert_eq!(result.payload["configurationKey"][0]["value"], "70");

        station.close(None).await.unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_call_error_surfaces_as_remote_error() {
        let (connection, outgoing_rx, session) = setup();
        let (server, mut station) = ws_pair().await;

        let runner = {
            let connection = connection.clone();
            let session = session.clone();
            tokio::spawn(async move { connection.run(server, &session, outgoing_rx).await })
        };

        let call = Call::new(Action::GetConfiguration, GetConfigurationRequest::default()).unwrap();
        let request = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(call).await })
        };

        let frame = next_frame(&mut station).await;
        send_frame(&mut station, json!([4, frame[1], "NotSupported", "no config", {}])).await;

        match request.await.unwrap() {
            Err(OcppError::RemoteError { code, description, .. }) => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no config");
            }
            other => panic!("Expected RemoteError, got {:?}", other),
        }

        station.close(None).await.unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_station_leaves() {
        let (connection, outgoing_rx, session) = setup();
        let (server, mut station) = ws_pair().await;

        let runner = {
            let connection = connection.clone();
            let session = session.clone();
            tokio::spawn(async move { connection.run(server, &session, outgoing_rx).await })
        };

        let call = Call::new(Action::GetConfiguration, GetConfigurationRequest::default()).unwrap();
        let request = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(call).await })
        };

        let _ = next_frame(&mut station).await;
        drop(station);

        assert!(matches!(request.await.unwrap(), Err(OcppError::ConnectionClosed)));
        let _ = runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let config = CentralSystemConfig::default().with_response_timeout(Duration::from_millis(50));
        let (connection, mut outgoing_rx) = Connection::new("CP1", &config);

        let call = Call::new(Action::GetConfiguration, GetConfigurationRequest::default()).unwrap();
        let request = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(call).await })
        };

        let sent = outgoing_rx.recv().await.unwrap();
        assert!(matches!(request.await.unwrap(), Err(OcppError::Timeout)));
        assert!(!connection.resolve(sent.message_id(), Err(OcppError::ConnectionClosed)).await);
    }
}
