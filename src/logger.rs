//! Append-only traffic log.
//!
//! Every message crossing the proxy becomes one JSON line; every failed
//! script hook becomes one error line. The file is only ever appended to,
//! so a session's records can be replayed or diffed after the fact.

use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

/// Which peer originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Client,
    Server,
}

/// What kind of message crossed the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Notification,
    Response,
}

#[derive(Serialize)]
struct MessageRecord<'a> {
    from: Direction,
    kind: Kind,
    method: &'a str,
    body: &'a Value,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    method: &'a str,
    err: &'a str,
}

/// Shared sink for traffic records.
///
/// The mutex guarantees each record lands as one complete line even when
/// concurrent in-flight calls log from their own tasks. Write failures are
/// reported to the diagnostic log and swallowed: losing observability must
/// not take the session down.
pub struct TrafficLog {
    sink: Mutex<File>,
}

impl TrafficLog {
    pub fn new(file: File) -> Self {
        Self {
            sink: Mutex::new(file),
        }
    }

    /// Record one message crossing the proxy.
    pub fn message(&self, from: Direction, kind: Kind, method: &str, body: &Value) {
        self.append(&MessageRecord {
            from,
            kind,
            method,
            body,
        });
    }

    /// Record a failed hook invocation (or a failed server spawn).
    pub fn error(&self, method: &str, err: &str) {
        self.append(&ErrorRecord { method, err });
    }

    fn append<T: Serialize>(&self, record: &T) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize traffic log record: {}", e);
                return;
            }
        };
        line.push(b'\n');

        let mut sink = self.sink.lock().unwrap();
        if let Err(e) = sink.write_all(&line) {
            tracing::warn!("Failed to append to traffic log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::OpenOptions;

    fn open_log(path: &std::path::Path) -> TrafficLog {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        TrafficLog::new(file)
    }

    #[test]
    fn test_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        let log = open_log(&path);

        log.message(
            Direction::Client,
            Kind::Request,
            "initialize",
            &json!({"capabilities": {}}),
        );
        log.error("workspace/symbol", "boom");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["from"], "client");
        assert_eq!(first["kind"], "request");
        assert_eq!(first["method"], "initialize");
        assert_eq!(first["body"], json!({"capabilities": {}}));

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["method"], "workspace/symbol");
        assert_eq!(second["err"], "boom");
    }

    #[test]
    fn test_reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");

        open_log(&path).message(Direction::Client, Kind::Notification, "exit", &Value::Null);
        open_log(&path).message(Direction::Server, Kind::Response, "shutdown", &Value::Null);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
