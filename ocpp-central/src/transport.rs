//! WebSocket accept path
//!
//! Charge points connect to `ws://<addr>:<port>/<stationId>`. The station id
//! is taken from the request path during the handshake.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use crate::config::CentralSystemConfig;
use crate::ocpp::OcppError;

/// Station id encoded in a request path, if any
pub fn station_id_from_path(path: &str) -> Option<&str> {
    let id = path.trim_matches('/');
    (!id.is_empty()).then_some(id)
}

/// Whether a `Sec-WebSocket-Protocol` header value offers `subprotocol`
fn offers(header: &str, subprotocol: &str) -> bool {
    header.split(',').any(|p| p.trim() == subprotocol)
}

/// Complete the WebSocket handshake and return the stream with its station id
///
/// Requests without a station id are refused with 400.
pub async fn accept_station<S>(
    stream: S,
    config: &CentralSystemConfig,
) -> Result<(WebSocketStream<S>, String), OcppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let subprotocol = config.subprotocol.as_str();
    let mut station_id = None;

    let callback = |request: &Request, mut response: Response| {
        let Some(id) = station_id_from_path(request.uri().path()) else {
            let mut refusal = ErrorResponse::new(Some("missing charge point id".to_string()));
            *refusal.status_mut() = StatusCode::BAD_REQUEST;
            return Err(refusal);
        };

        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| offers(v, subprotocol));

        if offered {
            match HeaderValue::from_str(subprotocol) {
                Ok(value) => {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                Err(e) => warn!("Cannot echo subprotocol {}: {}", subprotocol, e),
            }
        } else {
            warn!("Charge point {} did not offer subprotocol {}", id, subprotocol);
        }

        station_id = Some(id.to_string());
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await?;
    let station_id = station_id.ok_or(OcppError::InvalidFormat)?;

    Ok((ws, station_id))
}
