//! User-scripted message transforms.
//!
//! A script is two tables of async hooks keyed by LSP method name: client
//! hooks rewrite params on their way to the server, server hooks rewrite
//! results (and server-originated notification payloads) on their way back.
//! Hooks are fail-open: a hook that errors is recorded in the traffic log and
//! the original payload travels on unchanged. A hook can substitute a value
//! or be skipped; it can never abort the proxy.
//!
//! Scripts are compiled as dynamic libraries and loaded once at startup.
//! No hot-reloading: the tables are immutable for the life of the session.

use crate::logger::TrafficLog;
use anyhow::{Context, Result};
use libloading::{Library, Symbol};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

/// Boxed future returned by a hook invocation.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

type ClientHook = Box<dyn Fn(Value) -> HookFuture + Send + Sync>;
type ServerHook = Box<dyn Fn(Value, Option<Value>) -> HookFuture + Send + Sync>;

/// Symbol a script library must export: `fn lsproxy_script() -> Script`.
pub const SCRIPT_ENTRY_SYMBOL: &[u8] = b"lsproxy_script";

/// Signature of the script entry point.
pub type ScriptEntry = fn() -> Script;

/// Per-method transform tables for one proxy session.
#[derive(Default)]
pub struct Script {
    client: HashMap<String, ClientHook>,
    server: HashMap<String, ServerHook>,
    /// Keeps the script's code mapped for as long as its hooks are callable.
    _lib: Option<Library>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("client", &self.client.keys().collect::<Vec<_>>())
            .field("server", &self.server.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Script {
    /// An empty script: every method passes through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a script from a dynamic library.
    ///
    /// The library stays loaded inside the returned value; dropping the
    /// `Script` mid-session would leave hooks pointing at unmapped code.
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load script from {}", path.display()))?;

        let mut script = {
            let entry: Symbol<ScriptEntry> = unsafe { lib.get(SCRIPT_ENTRY_SYMBOL) }
                .with_context(|| {
                    format!("script {} does not export `lsproxy_script`", path.display())
                })?;
            entry()
        };

        tracing::info!(
            "Loaded script {} ({} client hooks, {} server hooks)",
            path.display(),
            script.client.len(),
            script.server.len()
        );
        script._lib = Some(lib);
        Ok(script)
    }

    /// Register a hook for params travelling client → server.
    pub fn client<F, Fut>(&mut self, method: &str, hook: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.client
            .insert(method.to_string(), Box::new(move |params| Box::pin(hook(params))));
    }

    /// Register a hook for payloads travelling server → client. The second
    /// argument is the params of the originating request, when there is one.
    pub fn server<F, Fut>(&mut self, method: &str, hook: F)
    where
        F: Fn(Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.server.insert(
            method.to_string(),
            Box::new(move |result, request_params| Box::pin(hook(result, request_params))),
        );
    }

    /// Run the client hook for `method`, if any. Absent params are presented
    /// to the hook as `null`; without a hook they stay absent, so unhooked
    /// methods survive a JSON round-trip byte for byte.
    pub async fn apply_client(
        &self,
        log: &TrafficLog,
        method: &str,
        params: Option<Value>,
    ) -> Option<Value> {
        let hook = match self.client.get(method) {
            Some(hook) => hook,
            None => return params,
        };

        match hook(params.clone().unwrap_or(Value::Null)).await {
            Ok(transformed) => Some(transformed),
            Err(err) => {
                log.error(method, &format!("{:#}", err));
                params
            }
        }
    }

    /// Run the server hook for `method`, if any. `request_params` carries the
    /// originating request's params; server-originated notifications have
    /// none.
    pub async fn apply_server(
        &self,
        log: &TrafficLog,
        method: &str,
        payload: Option<Value>,
        request_params: Option<&Value>,
    ) -> Option<Value> {
        let hook = match self.server.get(method) {
            Some(hook) => hook,
            None => return payload,
        };

        match hook(
            payload.clone().unwrap_or(Value::Null),
            request_params.cloned(),
        )
        .await
        {
            Ok(transformed) => Some(transformed),
            Err(err) => {
                log.error(method, &format!("{:#}", err));
                payload
            }
        }
    }
}
