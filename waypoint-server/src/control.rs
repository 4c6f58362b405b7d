//! The one-shot TCP control channel.
//!
//! Each accepted connection runs read -> dispatch -> write exactly once,
//! under a watchdog armed at accept. The protocol is newline-delimited
//! JSON with a hard document-size bound; any failure answers with one
//! best-effort `error` envelope before closing. Failures never escape
//! the connection's own task.

use crate::config::ControlConfig;
use crate::error::ServerError;
use crate::gateway::Gateway;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use waypoint_core::time;
use waypoint_protocol::{codec, ControlRequest, ControlResponse, LineDecoder, MAX_DOCUMENT_SIZE};

/// Handles one control connection from accept to close.
pub async fn handle_connection(
    gateway: Arc<Gateway>,
    mut stream: TcpStream,
    addr: SocketAddr,
    config: ControlConfig,
) {
    tracing::debug!(%addr, "open connection");
    let session_id = gateway.control_opened(addr.to_string());

    // watchdog: the whole one-shot exchange must finish inside the
    // wait timeout; the timer dies with this scope on close
    let outcome = tokio::time::timeout(
        config.wait_timeout(),
        exchange(&gateway, &mut stream, addr, &config),
    )
    .await;

    match outcome {
        Ok(Ok(task)) => {
            tracing::info!(%addr, task, "task done, response sent");
        }
        Ok(Err(err)) => {
            connection_error(&gateway, &mut stream, addr, &err).await;
        }
        Err(_) => {
            let err = ServerError::WaitTimeout(config.wait_timeout_secs);
            connection_error(&gateway, &mut stream, addr, &err).await;
        }
    }

    gateway.control_closed(session_id);
    tracing::debug!(%addr, "close connection");
}

/// Reads one framed document, dispatches it, writes the response.
/// Returns the task name that was answered.
async fn exchange(
    gateway: &Gateway,
    stream: &mut TcpStream,
    addr: SocketAddr,
    config: &ControlConfig,
) -> Result<String, ServerError> {
    let mut decoder = LineDecoder::new(MAX_DOCUMENT_SIZE);
    let mut buf = [0u8; 8192];

    let request: ControlRequest = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ServerError::StreamNotReadable(addr.to_string()));
        }
        decoder.extend(&buf[..n])?;
        if let Some(request) = decoder.decode_line()? {
            break request;
        }
    };

    tracing::info!(%addr, task = %request.task, "processing task");
    let response = dispatch(gateway, &request)?;

    let bytes = codec::encode(&response)?;
    stream
        .write_all(&bytes)
        .await
        .map_err(|_| ServerError::StreamNotWritable(addr.to_string()))?;
    if config.end_with_response {
        let _ = stream.shutdown().await;
    }
    Ok(response.task)
}

/// Translates one control document into an engine operation and builds
/// the response envelope.
pub fn dispatch(gateway: &Gateway, request: &ControlRequest) -> Result<ControlResponse, ServerError> {
    if request.task.is_empty() {
        return Err(ServerError::TaskMissing);
    }

    let mut add_stats = gateway.add_stats();
    let load = match request.task.as_str() {
        "getStats" => {
            add_stats = true;
            Value::Null
        }
        "healthCheck" => {
            add_stats = true;
            let token = request.load.as_f64().unwrap_or(0.0);
            json!(gateway.engine().set_health_check_token(token))
        }
        "characterUpdate" => {
            gateway.engine().character_update(&request.load);
            Value::Null
        }
        "characterLogout" => json!(gateway.engine().character_logout(&request.load)),
        "mapConnectionAccess" => gateway
            .engine()
            .map_connection_access(&request.load, time::unix_now()),
        "mapAccess" => json!(gateway.engine().map_access(&request.load)),
        "mapUpdate" => json!(gateway.engine().map_update(&request.load)),
        "mapDeleted" => {
            let map_id = request.load.as_i64().unwrap_or(0);
            json!(gateway.engine().map_deleted(map_id))
        }
        "logData" => {
            gateway.engine().log_data(&request.load);
            Value::Null
        }
        unknown => return Err(ServerError::TaskUnknown(unknown.to_string())),
    };

    let mut response = ControlResponse::new(&request.task, load);
    if add_stats {
        response = response.with_stats(gateway.socket_stats());
    }
    Ok(response)
}

/// Error path: one best-effort error envelope, then close.
async fn connection_error(
    gateway: &Gateway,
    stream: &mut TcpStream,
    addr: SocketAddr,
    err: &ServerError,
) {
    tracing::error!(%addr, %err, "connection error");

    let envelope = ControlResponse::error(err.to_string()).with_stats(gateway.socket_stats());
    if let Ok(bytes) = codec::encode(&envelope) {
        if stream.write_all(&bytes).await.is_ok() {
            let _ = stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn request(task: &str, load: Value) -> ControlRequest {
        ControlRequest {
            task: task.to_string(),
            load,
        }
    }

    #[test]
    fn test_dispatch_get_stats_always_attaches_stats() {
        let gateway = Gateway::new(false);
        let response = dispatch(&gateway, &request("getStats", Value::Null)).unwrap();
        assert_eq!(response.task, "getStats");
        assert!(response.load.is_null());
        assert!(response.stats.is_some());
    }

    #[test]
    fn test_dispatch_health_check_sets_token() {
        let gateway = Gateway::new(false);
        let response = dispatch(&gateway, &request("healthCheck", json!(1699999999.5))).unwrap();
        assert_eq!(response.load, json!(1699999999.5));
        assert!(response.stats.is_some());

        // the pushed token validates exactly once on the client side
        assert!(gateway
            .engine()
            .client_health_check(1699999999.0, 0.0)
            .is_some());
    }

    #[test]
    fn test_dispatch_missing_task() {
        let gateway = Gateway::new(false);
        let result = dispatch(&gateway, &request("", Value::Null));
        assert!(matches!(result, Err(ServerError::TaskMissing)));
    }

    #[test]
    fn test_dispatch_unknown_task() {
        let gateway = Gateway::new(false);
        let result = dispatch(&gateway, &request("selfDestruct", Value::Null));
        assert!(matches!(result, Err(ServerError::TaskUnknown(t)) if t == "selfDestruct"));
    }

    #[test]
    fn test_dispatch_stats_flag_covers_other_tasks() {
        let gateway = Gateway::new(false);
        let response = dispatch(&gateway, &request("mapDeleted", json!(5))).unwrap();
        assert!(response.stats.is_none());

        let gateway = Gateway::new(true);
        let response = dispatch(&gateway, &request("mapDeleted", json!(5))).unwrap();
        assert!(response.stats.is_some());
        assert_eq!(response.load, json!(0));
    }

    #[test]
    fn test_dispatch_map_connection_access() {
        let gateway = Gateway::new(false);
        let load = json!({
            "id": 100,
            "token": "abc",
            "characterData": {"id": 100, "name": "Pilot"},
            "mapData": [{"id": 5, "token": "xyz"}],
        });
        let response = dispatch(&gateway, &request("mapConnectionAccess", load)).unwrap();
        assert_eq!(response.load, json!("OK"));

        let response =
            dispatch(&gateway, &request("mapConnectionAccess", json!({"id": 100}))).unwrap();
        assert_eq!(response.load, json!(false));
    }

    #[test]
    fn test_dispatch_character_logout() {
        let gateway = Gateway::new(false);
        let response = dispatch(&gateway, &request("characterLogout", json!([100]))).unwrap();
        assert_eq!(response.load, json!(true));
    }

    async fn spawn_gateway(config: ControlConfig) -> (std::net::SocketAddr, Arc<Gateway>) {
        let gateway = Arc::new(Gateway::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_gateway = gateway.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let gateway = accept_gateway.clone();
                let config = config.clone();
                tokio::spawn(handle_connection(gateway, stream, peer, config));
            }
        });
        (addr, gateway)
    }

    async fn roundtrip(addr: std::net::SocketAddr, document: &[u8]) -> Value {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(document).await.unwrap();

        // one-shot: the server answers and closes
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        serde_json::from_slice(&response).unwrap()
    }

    #[tokio::test]
    async fn test_one_shot_exchange_over_tcp() {
        let (addr, _gateway) = spawn_gateway(ControlConfig::default()).await;

        let response = roundtrip(addr, b"{\"task\":\"getStats\",\"load\":null}\n").await;
        assert_eq!(response["task"], "getStats");
        assert!(response["stats"]["control"]["connections"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_task_answers_error_envelope() {
        let (addr, _gateway) = spawn_gateway(ControlConfig::default()).await;

        let response = roundtrip(addr, b"{\"task\":\"bogus\",\"load\":null}\n").await;
        assert_eq!(response["task"], "error");
        assert!(response["load"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn test_oversized_document_rejected_without_dispatch() {
        let (addr, gateway) = spawn_gateway(ControlConfig::default()).await;

        let mut document = Vec::with_capacity(MAX_DOCUMENT_SIZE + 64);
        document.extend_from_slice(b"{\"task\":\"healthCheck\",\"load\":\"");
        document.resize(MAX_DOCUMENT_SIZE + 32, b'x');

        let response = roundtrip(addr, &document).await;
        assert_eq!(response["task"], "error");
        assert!(response["load"].as_str().unwrap().contains("too large"));
        // the oversized healthCheck never reached the engine
        assert!(gateway.engine().client_health_check(1.0, 0.0).is_none());
    }

    #[tokio::test]
    async fn test_watchdog_times_out_silent_connection() {
        let config = ControlConfig {
            wait_timeout_secs: 0.2,
            ..ControlConfig::default()
        };
        let (addr, _gateway) = spawn_gateway(config).await;

        // connect and send nothing; the watchdog must answer and close
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();

        let value: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(value["task"], "error");
        assert!(value["load"].as_str().unwrap().contains("timeout"));
    }
}
