//! The proxy core: process supervision, message routing, session lifecycle.
//!
//! One session owns two [`Connection`]s (downstream to the editor, upstream
//! to a spawned language server) and relays traffic between them. Every
//! message is recorded in the traffic log; client params and server payloads
//! pass through the script's hooks on the way. Four lifecycle methods get
//! dedicated handling (`initialize`, `shutdown`, `exit`; `initialized` only
//! differs in its state transition), everything else takes the generic path.
//!
//! Requests are dispatched as their own tasks so any number of calls can be
//! in flight at once; notifications are handled inline in arrival order
//! because document sync (`didOpen`/`didChange`) is order-sensitive.

use crate::logger::{Direction, Kind, TrafficLog};
use crate::rpc::{Connection, Inbound, JsonRpcError, RequestError};
use crate::script::Script;
use anyhow::{bail, Context, Result};
use lsp_types::notification::{Exit, Initialized, Notification as LspNotification};
use lsp_types::request::{Initialize, Request as LspRequest, Shutdown};
use lsp_types::InitializeResult;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Lifecycle phases of a proxied session.
///
/// Tracked for diagnostics only; the proxy relays whatever the client sends
/// and does not police protocol ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Running,
    ShuttingDown,
    Terminated,
}

impl SessionState {
    fn advance(&mut self, method: &str) {
        let next = match method {
            m if m == Initialized::METHOD => SessionState::Running,
            m if m == Shutdown::METHOD => SessionState::ShuttingDown,
            m if m == Exit::METHOD => SessionState::Terminated,
            _ => return,
        };
        if next != *self {
            tracing::debug!("Session state {:?} -> {:?}", *self, next);
            *self = next;
        }
    }
}

/// Spawn the language server with piped stdio and build its connection.
///
/// The child's stderr is inherited so server-side noise stays visible to the
/// user; it is not part of the traffic log.
pub fn spawn_server(
    command: &[String],
    log: &TrafficLog,
) -> Result<(Child, Connection, mpsc::Receiver<Inbound>)> {
    let (program, args) = command.split_first().context("no server command given")?;

    tracing::info!("Spawning language server: {} {:?}", program, args);

    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            log.error("spawn", &err.to_string());
            return Err(err)
                .with_context(|| format!("failed to spawn language server `{}`", program));
        }
    };

    let stdin = child
        .stdin
        .take()
        .context("failed to get stdin of language server")?;
    let stdout = child
        .stdout
        .take()
        .context("failed to get stdout of language server")?;

    let (connection, inbound) = Connection::new(stdout, stdin);
    Ok((child, connection, inbound))
}

/// Run a full proxy session over the given client-facing streams.
///
/// Spawns `command` as the language server and relays traffic until the
/// client sends `exit` (resolves with exit code 0) or something fatal
/// happens: spawn failure, unexpected server death, or a dead client
/// connection.
pub async fn run_proxy<R, W>(
    command: &[String],
    script: Script,
    log: Arc<TrafficLog>,
    client_reader: R,
    client_writer: W,
) -> Result<i32>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (child, server, server_rx) = spawn_server(command, &log)?;
    let (client, client_rx) = Connection::new(client_reader, client_writer);
    run_session(client, client_rx, server, server_rx, child, script, log).await
}

/// Route traffic between an already-wired client and server until the
/// session settles.
pub async fn run_session(
    client: Connection,
    mut client_rx: mpsc::Receiver<Inbound>,
    server: Connection,
    mut server_rx: mpsc::Receiver<Inbound>,
    mut child: Child,
    script: Script,
    log: Arc<TrafficLog>,
) -> Result<i32> {
    let router = Router {
        client,
        server,
        script: Arc::new(script),
        log,
    };
    let mut state = SessionState::Init;
    let mut server_gone = false;

    // The loop settles only on `exit`; every other way out is an error.
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait on language server")?;
                bail!("language server exited unexpectedly with {}", status);
            }

            inbound = client_rx.recv() => match inbound {
                Some(Inbound::Request { id, method, params }) => {
                    state.advance(&method);
                    let router = router.clone();
                    tokio::spawn(async move {
                        router.client_request(id, method, params).await;
                    });
                }
                Some(Inbound::Notification { method, params }) => {
                    state.advance(&method);
                    if method == Exit::METHOD {
                        router.log.message(
                            Direction::Client,
                            Kind::Notification,
                            &method,
                            body(&params),
                        );
                        break;
                    }
                    router.client_notification(method, params).await;
                }
                None => bail!("client disconnected without sending exit"),
            },

            inbound = server_rx.recv(), if !server_gone => match inbound {
                Some(Inbound::Request { id, method, params }) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        router.server_request(id, method, params).await;
                    });
                }
                Some(Inbound::Notification { method, params }) => {
                    router.server_notification(method, params).await;
                }
                // Server closed its stdout; the child.wait() arm decides
                // what that means.
                None => server_gone = true,
            },
        }
    }

    // exit never reaches the server; the supervisor tears the process down.
    if let Err(err) = child.kill().await {
        tracing::warn!("Failed to kill language server: {}", err);
    }
    Ok(0)
}

#[derive(Clone)]
struct Router {
    client: Connection,
    server: Connection,
    script: Arc<Script>,
    log: Arc<TrafficLog>,
}

impl Router {
    /// Client → server request: the generic path, with `initialize` and
    /// `shutdown` carved out.
    async fn client_request(&self, id: Value, method: String, params: Option<Value>) {
        // The graceful-stop signal is not transformable: no hook stages.
        if method == Shutdown::METHOD {
            self.log
                .message(Direction::Client, Kind::Request, &method, body(&params));
            match self.server.request(&method, params).await {
                Ok(result) => {
                    self.log
                        .message(Direction::Server, Kind::Response, &method, &result);
                    self.client.respond(id, result);
                }
                Err(err) => self.relay_error(&self.client, id, &method, err),
            }
            return;
        }

        // initialize is logged as received; everything else logs the
        // hook-transformed params.
        let params = if method == Initialize::METHOD {
            self.log
                .message(Direction::Client, Kind::Request, &method, body(&params));
            self.script.apply_client(&self.log, &method, params).await
        } else {
            let params = self.script.apply_client(&self.log, &method, params).await;
            self.log
                .message(Direction::Client, Kind::Request, &method, body(&params));
            params
        };

        match self.server.request(&method, params.clone()).await {
            Ok(result) => {
                let result = self
                    .script
                    .apply_server(&self.log, &method, Some(result), params.as_ref())
                    .await
                    .unwrap_or(Value::Null);
                if method == Initialize::METHOD {
                    log_negotiated_capabilities(&result);
                }
                self.log
                    .message(Direction::Server, Kind::Response, &method, &result);
                self.client.respond(id, result);
            }
            Err(err) => self.relay_error(&self.client, id, &method, err),
        }
    }

    /// Client → server notification (exit never gets here).
    async fn client_notification(&self, method: String, params: Option<Value>) {
        let params = self.script.apply_client(&self.log, &method, params).await;
        self.log
            .message(Direction::Client, Kind::Notification, &method, body(&params));
        self.server.notify(&method, params);
    }

    /// Server → client request, relayed verbatim: only notifications pass
    /// through script hooks in this direction.
    async fn server_request(&self, id: Value, method: String, params: Option<Value>) {
        self.log
            .message(Direction::Server, Kind::Request, &method, body(&params));
        match self.client.request(&method, params).await {
            Ok(result) => {
                self.log
                    .message(Direction::Client, Kind::Response, &method, &result);
                self.server.respond(id, result);
            }
            Err(err) => self.relay_error(&self.server, id, &method, err),
        }
    }

    /// Server → client notification. The hook gets no request-params context
    /// because nothing originated this message.
    async fn server_notification(&self, method: String, params: Option<Value>) {
        let params = self
            .script
            .apply_server(&self.log, &method, params, None)
            .await;
        self.log
            .message(Direction::Server, Kind::Notification, &method, body(&params));
        self.client.notify(&method, params);
    }

    /// A forwarded request did not produce a result: relay the peer's error
    /// object, or synthesize one when the other connection died under us.
    /// Error responses are not traffic-logged (only success results are).
    fn relay_error(&self, to: &Connection, id: Value, method: &str, err: RequestError) {
        match err {
            RequestError::Rpc(error) => {
                tracing::debug!(
                    "Relaying error response for {}: {} (code {})",
                    method,
                    error.message,
                    error.code
                );
                to.respond_error(id, error);
            }
            RequestError::Closed => {
                tracing::debug!("Connection lost while forwarding {}", method);
                to.respond_error(
                    id,
                    JsonRpcError {
                        code: -32603,
                        message: format!("proxy: connection lost while forwarding {}", method),
                        data: None,
                    },
                );
            }
        }
    }
}

fn body(params: &Option<Value>) -> &Value {
    params.as_ref().unwrap_or(&Value::Null)
}

fn log_negotiated_capabilities(result: &Value) {
    match serde_json::from_value::<InitializeResult>(result.clone()) {
        Ok(init) => {
            let name = init
                .server_info
                .as_ref()
                .map(|info| info.name.as_str())
                .unwrap_or("unknown");
            tracing::info!("Language server `{}` completed initialize handshake", name);
        }
        Err(err) => {
            tracing::warn!("initialize response is not an InitializeResult: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_transitions() {
        let mut state = SessionState::Init;
        state.advance(Initialize::METHOD);
        assert_eq!(state, SessionState::Init);
        state.advance(Initialized::METHOD);
        assert_eq!(state, SessionState::Running);
        state.advance("textDocument/didOpen");
        assert_eq!(state, SessionState::Running);
        state.advance(Shutdown::METHOD);
        assert_eq!(state, SessionState::ShuttingDown);
        state.advance(Exit::METHOD);
        assert_eq!(state, SessionState::Terminated);
    }

    #[test]
    fn test_shortcut_exit_is_tracked() {
        // Clients may skip shutdown entirely; the state machine follows along.
        let mut state = SessionState::Init;
        state.advance(Exit::METHOD);
        assert_eq!(state, SessionState::Terminated);
    }
}
