//! JSON-RPC plumbing shared by both sides of the proxy.
//!
//! This module implements the LSP wire format over arbitrary byte streams:
//! - The JSON-RPC message model (requests, responses, notifications)
//! - `Content-Length` header framing
//! - [`Connection`], a peer handle that owns a writer task and a reader task,
//!   correlates responses to in-flight requests by id, and surfaces inbound
//!   requests/notifications on a channel
//!
//! A proxy sits between two peers that both originate traffic, so the
//! connection must relay foreign request ids verbatim: inbound ids are kept
//! as raw JSON values, while ids for requests *we* originate are a private
//! integer counter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// A JSON-RPC message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// A JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC notification (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound message that the peer originated.
///
/// Responses to requests we sent never show up here; the reader task resolves
/// those against the pending map directly.
#[derive(Debug)]
pub enum Inbound {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Why an outgoing request did not produce a result.
#[derive(Debug)]
pub enum RequestError {
    /// The peer answered with a JSON-RPC error object.
    Rpc(JsonRpcError),
    /// The connection went away before a response arrived.
    Closed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Rpc(err) => write!(f, "{} (code {})", err.message, err.code),
            RequestError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Write one `Content-Length`-framed message.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one `Content-Length`-framed message.
///
/// Returns `Ok(None)` on a clean end of stream (the peer closed between
/// messages); EOF in the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;

        if n == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside message headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        if let Some(value) = line.strip_prefix("Content-Length: ") {
            content_length = Some(value.trim().parse().map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("invalid Content-Length: {}", e))
            })?);
        }
    }

    let content_length = content_length
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header"))?;

    let mut content = vec![0u8; content_length];
    reader.read_exact(&mut content).await?;

    Ok(Some(content))
}

/// In-flight requests awaiting a response, plus a closed flag so a request
/// racing against connection teardown fails instead of waiting forever.
#[derive(Default)]
struct Pending {
    closed: bool,
    map: HashMap<i64, oneshot::Sender<Result<Value, JsonRpcError>>>,
}

impl Pending {
    fn close(&mut self) {
        self.closed = true;
        self.map.clear();
    }
}

type PendingMap = Arc<Mutex<Pending>>;

/// One side of the proxy: a JSON-RPC peer over a byte stream pair.
///
/// Cloning is cheap; clones share the writer and the pending-request map, so
/// any number of in-flight calls can be outstanding at once.
#[derive(Clone)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    pending: PendingMap,
    next_id: Arc<AtomicI64>,
}

impl Connection {
    /// Wire a connection over the given streams.
    ///
    /// Spawns the writer and reader tasks. Messages originated by the peer
    /// arrive on the returned channel; the channel closing means the peer
    /// hung up, or sent something unparseable. Framing errors are not
    /// recoverable.
    pub fn new<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let pending: PendingMap = Arc::new(Mutex::new(Pending::default()));

        let pending_writer = pending.clone();
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let payload = match serde_json::to_vec(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &payload).await {
                    tracing::debug!("Connection writer stopped: {}", e);
                    break;
                }
            }
            pending_writer.lock().unwrap().close();
        });

        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                let bytes = match read_frame(&mut reader).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Connection reader stopped: {}", e);
                        break;
                    }
                };

                match serde_json::from_slice::<JsonRpcMessage>(&bytes) {
                    Ok(JsonRpcMessage::Request(request)) => {
                        let inbound = Inbound::Request {
                            id: request.id,
                            method: request.method,
                            params: request.params,
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(JsonRpcMessage::Notification(notification)) => {
                        let inbound = Inbound::Notification {
                            method: notification.method,
                            params: notification.params,
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(JsonRpcMessage::Response(response)) => {
                        resolve_response(&pending_reader, response);
                    }
                    Err(e) => {
                        tracing::error!("Malformed message on connection: {}", e);
                        break;
                    }
                }
            }
            // Fail every call still waiting on this peer.
            pending_reader.lock().unwrap().close();
        });

        (
            Self {
                outbound: outbound_tx,
                pending,
                next_id: Arc::new(AtomicI64::new(0)),
            },
            inbound_rx,
        )
    }

    /// Send a request and await the peer's response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.closed {
                return Err(RequestError::Closed);
            }
            pending.map.insert(id, tx);
        }

        let request = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        });

        if self.outbound.send(request).is_err() {
            self.pending.lock().unwrap().map.remove(&id);
            return Err(RequestError::Closed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RequestError::Rpc(error)),
            Err(_) => Err(RequestError::Closed),
        }
    }

    /// Send a notification. Fire-and-forget: a dead connection is reported by
    /// the session loop, not by the individual send.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        let notification = JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        });
        if self.outbound.send(notification).is_err() {
            tracing::debug!("Dropping notification {}: connection closed", method);
        }
    }

    /// Answer a request the peer sent us.
    pub fn respond(&self, id: Value, result: Value) {
        let response = JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        });
        if self.outbound.send(response).is_err() {
            tracing::debug!("Dropping response: connection closed");
        }
    }

    /// Answer a request the peer sent us with a JSON-RPC error.
    pub fn respond_error(&self, id: Value, error: JsonRpcError) {
        let response = JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        });
        if self.outbound.send(response).is_err() {
            tracing::debug!("Dropping error response: connection closed");
        }
    }
}

fn resolve_response(pending: &PendingMap, response: JsonRpcResponse) {
    let id = match response.id.as_i64() {
        Some(id) => id,
        None => {
            tracing::warn!("Received response with non-numeric id {:?}", response.id);
            return;
        }
    };

    let tx = match pending.lock().unwrap().map.remove(&id) {
        Some(tx) => tx,
        None => {
            tracing::warn!("Received response for unknown request id={}", id);
            return;
        }
    };

    let outcome = match response.error {
        Some(error) => Err(error),
        // A result of `null` is legal (e.g. shutdown) and distinct from an
        // error; serde folds it into `None`, so restore it here.
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, split};

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(1),
            method: "initialize".to_string(),
            params: Some(json!({"rootUri": "file:///test"})),
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(json.contains("\"rootUri\":\"file:///test\""));
    }

    #[test]
    fn test_request_without_params_omits_field() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(7),
            method: "shutdown".to_string(),
            params: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("\"params\""));
    }

    #[test]
    fn test_response_serialization() {
        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: Value::from(1),
            result: Some(json!({"success": true})),
            error: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_notification_serialization() {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: "textDocument/didOpen".to_string(),
            params: Some(json!({"uri": "file:///test.rs"})),
        };

        let json = serde_json::to_string(&notification).unwrap();
        assert!(json.contains("\"method\":\"textDocument/didOpen\""));
        assert!(!json.contains("\"id\"")); // Notifications have no ID
    }

    #[test]
    fn test_message_deserialization_request() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"rootUri":"file:///test"}}"#;
        let message: JsonRpcMessage = serde_json::from_str(json).unwrap();

        match message {
            JsonRpcMessage::Request(request) => {
                assert_eq!(request.id, Value::from(1));
                assert_eq!(request.method, "initialize");
                assert!(request.params.is_some());
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn test_message_deserialization_string_id() {
        let json = r#"{"jsonrpc":"2.0","id":"abc-1","method":"workspace/symbol","params":{}}"#;
        let message: JsonRpcMessage = serde_json::from_str(json).unwrap();

        match message {
            JsonRpcMessage::Request(request) => {
                assert_eq!(request.id, Value::from("abc-1"));
            }
            _ => panic!("Expected Request"),
        }
    }

    #[test]
    fn test_message_deserialization_response() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"success":true}}"#;
        let message: JsonRpcMessage = serde_json::from_str(json).unwrap();

        match message {
            JsonRpcMessage::Response(response) => {
                assert!(response.result.is_some());
                assert!(response.error.is_none());
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn test_message_deserialization_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"textDocument/didOpen","params":{"uri":"file:///test.rs"}}"#;
        let message: JsonRpcMessage = serde_json::from_str(json).unwrap();

        match message {
            JsonRpcMessage::Notification(notification) => {
                assert_eq!(notification.method, "textDocument/didOpen");
            }
            _ => panic!("Expected Notification"),
        }
    }

    #[test]
    fn test_error_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid request"}}"#;
        let message: JsonRpcMessage = serde_json::from_str(json).unwrap();

        match message {
            JsonRpcMessage::Response(response) => {
                assert!(response.result.is_none());
                let error = response.error.unwrap();
                assert_eq!(error.code, -32600);
                assert_eq!(error.message, "Invalid request");
            }
            _ => panic!("Expected Response with error"),
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, b) = duplex(1024);
        let payload = br#"{"jsonrpc":"2.0","method":"x"}"#;
        write_frame(&mut a, payload).await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let read = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(read, payload);

        // The stream is closed now; the next read is a clean EOF.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_missing_content_length() {
        let (mut a, b) = duplex(1024);
        a.write_all(b"Content-Type: application/json\r\n\r\n{}").await.unwrap();
        drop(a);

        let mut reader = BufReader::new(b);
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_connection_request_response() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (conn, _inbound) = Connection::new(our_read, our_write);

        // Fake peer: answer whatever request arrives with its own params.
        let (their_read, mut their_write) = split(theirs);
        tokio::spawn(async move {
            let mut reader = BufReader::new(their_read);
            let bytes = read_frame(&mut reader).await.unwrap().unwrap();
            let request: JsonRpcRequest = serde_json::from_slice(&bytes).unwrap();
            let response = json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "result": request.params,
            });
            write_frame(&mut their_write, &serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
        });

        let result = conn
            .request("textDocument/hover", Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_connection_relays_error_responses() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (conn, _inbound) = Connection::new(our_read, our_write);

        let (their_read, mut their_write) = split(theirs);
        tokio::spawn(async move {
            let mut reader = BufReader::new(their_read);
            let bytes = read_frame(&mut reader).await.unwrap().unwrap();
            let request: JsonRpcRequest = serde_json::from_slice(&bytes).unwrap();
            let response = json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "error": {"code": -32601, "message": "Method not found"},
            });
            write_frame(&mut their_write, &serde_json::to_vec(&response).unwrap())
                .await
                .unwrap();
        });

        match conn.request("no/such/method", None).await {
            Err(RequestError::Rpc(error)) => assert_eq!(error.code, -32601),
            other => panic!("Expected Rpc error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connection_closed_fails_pending_requests() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (conn, _inbound) = Connection::new(our_read, our_write);

        drop(theirs);

        match conn.request("textDocument/hover", None).await {
            Err(RequestError::Closed) => {}
            other => panic!("Expected Closed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connection_surfaces_inbound_traffic() {
        let (ours, theirs) = duplex(4096);
        let (our_read, our_write) = split(ours);
        let (_conn, mut inbound) = Connection::new(our_read, our_write);

        let (_their_read, mut their_write) = split(theirs);
        let request = json!({"jsonrpc":"2.0","id":9,"method":"workspace/configuration","params":{"items":[]}});
        write_frame(&mut their_write, &serde_json::to_vec(&request).unwrap())
            .await
            .unwrap();
        let notification = json!({"jsonrpc":"2.0","method":"exit"});
        write_frame(&mut their_write, &serde_json::to_vec(&notification).unwrap())
            .await
            .unwrap();

        match inbound.recv().await.unwrap() {
            Inbound::Request { id, method, .. } => {
                assert_eq!(id, Value::from(9));
                assert_eq!(method, "workspace/configuration");
            }
            other => panic!("Expected request, got {:?}", other),
        }
        match inbound.recv().await.unwrap() {
            Inbound::Notification { method, params } => {
                assert_eq!(method, "exit");
                assert!(params.is_none());
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }
}
