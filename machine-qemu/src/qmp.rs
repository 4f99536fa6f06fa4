//! QMP (QEMU Machine Protocol) client.
//!
//! Each call opens a fresh connection to the control socket and runs the
//! whole exchange on it:
//!
//! 1. Server pushes a greeting (`{"QMP": {...}}`); it is read and discarded.
//! 2. Client sends `{"execute":"qmp_capabilities"}`, server answers `{"return":{}}`.
//! 3. Client sends `{"execute":"<command>"}` and reads exactly one reply.
//!
//! Messages are not length-delimited. Incoming bytes are buffered until a
//! complete JSON value parses, and asynchronous `{"event":...}` messages are
//! skipped while waiting for a reply.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use machine::MachineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};

/// Commands with this prefix return their result in the reply object.
pub const QUERY_PREFIX: &str = "query-";

const READ_CHUNK: usize = 4096;

/// Result object of a successful command.
pub type ControlReply = Value;

/// A QMP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Capabilities,
    QueryStatus,
    /// ACPI power button.
    SystemPowerdown,
    /// Terminate the hypervisor.
    Quit,
    /// Pause vCPUs.
    Stop,
    /// Resume vCPUs.
    Cont,
    SystemReset,
    Other(String),
}

impl ControlCommand {
    pub fn name(&self) -> &str {
        match self {
            Self::Capabilities => "qmp_capabilities",
            Self::QueryStatus => "query-status",
            Self::SystemPowerdown => "system_powerdown",
            Self::Quit => "quit",
            Self::Stop => "stop",
            Self::Cont => "cont",
            Self::SystemReset => "system_reset",
            Self::Other(name) => name,
        }
    }

    pub fn is_query(&self) -> bool {
        self.name().starts_with(QUERY_PREFIX)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QmpError {
    #[error("connect {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by hypervisor")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("capabilities negotiation failed: {0}")]
    Handshake(String),

    #[error("{command} failed: {payload}")]
    Command { command: String, payload: String },

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl From<QmpError> for MachineError {
    fn from(e: QmpError) -> Self {
        match e {
            QmpError::Command { command, payload } => {
                MachineError::CommandFailed { command, payload }
            }
            other => MachineError::Protocol(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    execute: &'a str,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Greeting {
    #[serde(rename = "QMP")]
    qmp: GreetingBody,
}

#[derive(Debug, Deserialize)]
struct GreetingBody {
    version: GreetingVersion,
    #[serde(default)]
    capabilities: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GreetingVersion {
    qemu: QemuVersion,
    #[serde(default)]
    package: String,
}

#[derive(Debug, Deserialize)]
struct QemuVersion {
    major: u32,
    minor: u32,
    micro: u32,
}

/// An empty result object (`{}`) or an absent one.
fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Client for one machine's control socket.
#[derive(Debug, Clone)]
pub struct QmpClient {
    socket: PathBuf,
    timeout: Duration,
}

impl QmpClient {
    pub fn new(socket: &Path, timeout: Duration) -> Self {
        Self {
            socket: socket.to_path_buf(),
            timeout,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Run one command on a fresh connection.
    ///
    /// Query commands return their populated result. Any other command must
    /// answer with an empty result; a populated one is reported as a command
    /// failure carrying the payload.
    pub async fn execute(&self, command: &ControlCommand) -> Result<ControlReply, QmpError> {
        tokio::time::timeout(self.timeout, self.execute_inner(command))
            .await
            .map_err(|_| QmpError::Timeout(self.timeout))?
    }

    async fn execute_inner(&self, command: &ControlCommand) -> Result<ControlReply, QmpError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| QmpError::Connect {
                path: self.socket.clone(),
                source,
            })?;
        let mut conn = Connection::new(stream);

        conn.read_greeting().await?;

        conn.send(ControlCommand::Capabilities.name()).await?;
        let ret = conn.read_reply(ControlCommand::Capabilities.name()).await?;
        if !is_empty_result(&ret) {
            return Err(QmpError::Handshake(ret.to_string()));
        }

        conn.send(command.name()).await?;
        let ret = conn.read_reply(command.name()).await?;
        if command.is_query() || is_empty_result(&ret) {
            debug!(command = command.name(), "qmp command ok");
            return Ok(ret);
        }
        Err(QmpError::Command {
            command: command.name().to_string(),
            payload: ret.to_string(),
        })
    }
}

/// Buffered QMP connection.
struct Connection {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), QmpError> {
        let data = serde_json::to_vec(&Request { execute: command })
            .map_err(|e| QmpError::Malformed(e.to_string()))?;
        trace!(command, "qmp send");
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Read the server greeting. Transport failures are fatal; a greeting
    /// that does not parse is logged and dropped through its first newline.
    async fn read_greeting(&mut self) -> Result<(), QmpError> {
        match self.read_value().await {
            Ok(value) => match serde_json::from_value::<Greeting>(value) {
                Ok(greeting) => {
                    let v = &greeting.qmp.version;
                    debug!(
                        version = %format!("{}.{}.{}", v.qemu.major, v.qemu.minor, v.qemu.micro),
                        package = %v.package,
                        capabilities = greeting.qmp.capabilities.len(),
                        "qmp greeting"
                    );
                }
                Err(e) => warn!(error = %e, "unexpected qmp greeting"),
            },
            Err(QmpError::Malformed(e)) => {
                warn!(error = %e, "unparseable qmp greeting");
                self.discard_line().await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Drop buffered bytes through the next newline, reading until one arrives.
    async fn discard_line(&mut self) -> Result<(), QmpError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
                self.buf.drain(..=end);
                return Ok(());
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(QmpError::Closed);
            }
            self.buf.extend_from_slice(chunk.get(..n).unwrap_or_default());
        }
    }

    /// Read the reply to `command`, skipping interleaved events.
    async fn read_reply(&mut self, command: &str) -> Result<Value, QmpError> {
        loop {
            let value = self.read_value().await?;
            if let Some(event) = value.get("event") {
                trace!(%event, "qmp event skipped");
                continue;
            }
            let reply: Reply = serde_json::from_value(value.clone())
                .map_err(|e| QmpError::Malformed(format!("{e}: {value}")))?;
            if let Some(error) = reply.error {
                return Err(QmpError::Command {
                    command: command.to_string(),
                    payload: error.to_string(),
                });
            }
            return reply
                .ret
                .ok_or_else(|| QmpError::Malformed(format!("reply without result: {value}")));
        }
    }

    /// Read one complete JSON value, pulling more bytes as needed.
    async fn read_value(&mut self) -> Result<Value, QmpError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(value) = self.take_value()? {
                return Ok(value);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(QmpError::Closed);
            }
            // n <= chunk.len() is guaranteed by read()
            self.buf.extend_from_slice(chunk.get(..n).unwrap_or_default());
        }
    }

    /// Parse and drain the first complete value in the buffer, if any.
    fn take_value(&mut self) -> Result<Option<Value>, QmpError> {
        let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        let next = values.next();
        let consumed = values.byte_offset();
        match next {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(QmpError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Status string from a `query-status` result.
pub fn run_status(reply: &ControlReply) -> Option<&str> {
    reply.get("status").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{FakeQmp, Script, return_message};

    fn client(socket: &Path) -> QmpClient {
        QmpClient::new(socket, Duration::from_secs(5))
    }

    #[test]
    fn command_names() {
        assert_eq!(ControlCommand::QueryStatus.name(), "query-status");
        assert!(ControlCommand::QueryStatus.is_query());
        assert!(!ControlCommand::SystemPowerdown.is_query());
        assert!(ControlCommand::Other("query-block".into()).is_query());
        assert_eq!(ControlCommand::Quit.name(), "quit");
    }

    #[tokio::test]
    async fn query_returns_populated_result() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeQmp::start(&dir.path().join("monitor"), Script::status("running"));

        let reply = client(server.socket())
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap();
        assert_eq!(run_status(&reply), Some("running"));
        assert_eq!(server.commands(), ["query-status"]);
    }

    #[tokio::test]
    async fn non_query_with_empty_result_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeQmp::start(&dir.path().join("monitor"), Script::status("running"));

        let reply = client(server.socket())
            .execute(&ControlCommand::SystemPowerdown)
            .await
            .unwrap();
        assert!(is_empty_result(&reply));
        assert_eq!(server.commands(), ["system_powerdown"]);
    }

    #[tokio::test]
    async fn non_query_with_populated_result_fails_with_payload() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            command_reply: Some(return_message(json!({"unexpected": "value"}))),
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let err = client(server.socket())
            .execute(&ControlCommand::Quit)
            .await
            .unwrap_err();
        let QmpError::Command { command, payload } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(command, "quit");
        assert!(payload.contains("unexpected"), "{payload}");
    }

    #[tokio::test]
    async fn non_empty_handshake_aborts_before_command() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            capabilities_reply: return_message(json!({"oops": true})),
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let err = client(server.socket())
            .execute(&ControlCommand::SystemPowerdown)
            .await
            .unwrap_err();
        assert!(matches!(err, QmpError::Handshake(_)), "{err}");
        server.wait_idle().await;
        assert!(server.commands().is_empty());
    }

    #[tokio::test]
    async fn error_reply_is_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            command_reply: Some(json!({
                "error": {"class": "CommandNotFound", "desc": "The command foo has not been found"}
            })),
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let err = client(server.socket())
            .execute(&ControlCommand::Other("foo".into()))
            .await
            .unwrap_err();
        let err = MachineError::from(err);
        let MachineError::CommandFailed { command, payload } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(command, "foo");
        assert!(payload.contains("CommandNotFound"));
    }

    #[tokio::test]
    async fn unparseable_greeting_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            greeting: b"QEMU monitor ready\r\n".to_vec(),
            ..Script::status("paused")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let reply = client(server.socket())
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap();
        assert_eq!(run_status(&reply), Some("paused"));
    }

    #[tokio::test]
    async fn unparseable_greeting_split_across_writes_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            greeting: b"QEMU monitor on /run/qemu/dev.sock ready\r\n".to_vec(),
            split_greeting: true,
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let reply = client(server.socket())
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap();
        assert_eq!(run_status(&reply), Some("running"));
        assert_eq!(server.commands(), ["query-status"]);
    }

    #[tokio::test]
    async fn events_before_reply_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            events_before_reply: vec![json!({
                "event": "POWERDOWN",
                "timestamp": {"seconds": 1, "microseconds": 2}
            })],
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        client(server.socket())
            .execute(&ControlCommand::SystemPowerdown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reply_split_across_writes_is_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            split_replies: true,
            ..Script::status("shutdown")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let reply = client(server.socket())
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap();
        assert_eq!(run_status(&reply), Some("shutdown"));
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            close_after_greeting: true,
            ..Script::status("running")
        };
        let server = FakeQmp::start(&dir.path().join("monitor"), script);

        let err = client(server.socket())
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap_err();
        assert!(
            matches!(err, QmpError::Closed | QmpError::Io(_)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = client(&dir.path().join("monitor"))
            .execute(&ControlCommand::QueryStatus)
            .await
            .unwrap_err();
        assert!(matches!(err, QmpError::Connect { .. }), "{err}");
        assert!(matches!(MachineError::from(err), MachineError::Protocol(_)));
    }
}
