//! A transparent proxy for the Language Server Protocol.
//!
//! lsproxy sits between an editor and a real language-server process,
//! relaying every JSON-RPC message in both directions while recording a
//! structured log of all traffic and applying user-scripted per-method
//! rewrites to request params and response payloads.

pub mod logger;
pub mod proxy;
pub mod rpc;
pub mod script;
