//! In-process fakes for the control socket and the guest SSH port.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::JoinHandle;

pub(crate) const SSH_BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";

/// Build a `{"return": ...}` reply.
pub(crate) fn return_message(ret: Value) -> Value {
    let mut map = Map::new();
    map.insert("return".to_string(), ret);
    Value::Object(map)
}

/// How the fake QMP server answers each connection.
pub(crate) struct Script {
    pub greeting: Vec<u8>,
    /// Write the greeting in two halves with a pause in between.
    pub split_greeting: bool,
    pub capabilities_reply: Value,
    /// Status reported by `query-status`.
    pub status: String,
    /// Fixed reply for every command, overriding the defaults.
    pub command_reply: Option<Value>,
    pub events_before_reply: Vec<Value>,
    /// Write each reply in two halves with a pause in between.
    pub split_replies: bool,
    pub close_after_greeting: bool,
    /// `system_powerdown` makes the hypervisor exit, as QEMU does without
    /// `-no-shutdown` once the guest powers off.
    pub powerdown_exits: bool,
}

impl Script {
    pub fn status(status: &str) -> Self {
        let greeting = json!({
            "QMP": {
                "version": {
                    "qemu": {"micro": 0, "minor": 2, "major": 8},
                    "package": "Debian 1:8.2.2+ds-0ubuntu1"
                },
                "capabilities": ["oob"]
            }
        });
        Self {
            greeting: format!("{greeting}\r\n").into_bytes(),
            split_greeting: false,
            capabilities_reply: return_message(json!({})),
            status: status.to_string(),
            command_reply: None,
            events_before_reply: Vec::new(),
            split_replies: false,
            close_after_greeting: false,
            powerdown_exits: false,
        }
    }

    fn exits_on(&self, command: &str) -> bool {
        command == "quit" || (self.powerdown_exits && command == "system_powerdown")
    }

    fn reply_to(&self, command: &str) -> Value {
        if let Some(reply) = &self.command_reply {
            return reply.clone();
        }
        if command == "query-status" {
            return return_message(json!({
                "status": self.status,
                "singlestep": false,
                "running": self.status == "running",
            }));
        }
        return_message(json!({}))
    }
}

/// Fake QMP server on a Unix socket. Records every command received after
/// capabilities negotiation. A command that makes the hypervisor exit unlinks
/// the socket, so later connects fail the way they do against a dead QEMU.
pub(crate) struct FakeQmp {
    socket: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeQmp {
    pub fn start(socket: &Path, script: Script) -> Self {
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket).unwrap();
        let script = Arc::new(script);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let task = {
            let socket = socket.to_path_buf();
            let commands = Arc::clone(&commands);
            let active = Arc::clone(&active);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    active.fetch_add(1, Ordering::AcqRel);
                    let socket = socket.clone();
                    let script = Arc::clone(&script);
                    let commands = Arc::clone(&commands);
                    let active = Arc::clone(&active);
                    tokio::spawn(async move {
                        let _ = serve(stream, &socket, &script, &commands).await;
                        active.fetch_sub(1, Ordering::AcqRel);
                    });
                }
            })
        };

        Self {
            socket: socket.to_path_buf(),
            commands,
            active,
            task,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Wait until every accepted connection has been fully handled.
    pub async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake qmp server still busy");
    }
}

impl Drop for FakeQmp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: UnixStream,
    socket: &Path,
    script: &Script,
    commands: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = Vec::new();

    write_bytes(&mut writer, &script.greeting, script.split_greeting).await?;
    if script.close_after_greeting {
        return Ok(());
    }

    if read_request(&mut reader, &mut buf).await?.is_none() {
        return Ok(());
    }
    write_message(&mut writer, &script.capabilities_reply, false).await?;

    let Some(command) = read_request(&mut reader, &mut buf).await? else {
        return Ok(());
    };
    commands.lock().unwrap().push(command.clone());
    if script.exits_on(&command) {
        let _ = std::fs::remove_file(socket);
    }

    for event in &script.events_before_reply {
        write_message(&mut writer, event, false).await?;
    }
    write_message(&mut writer, &script.reply_to(&command), script.split_replies).await?;

    // Hold the connection until the client hangs up.
    let mut rest = [0u8; 64];
    while reader.read(&mut rest).await? > 0 {}
    Ok(())
}

/// Read one `{"execute": ...}` request. `None` when the client hung up.
async fn read_request(
    reader: &mut (impl AsyncRead + Unpin),
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    let mut chunk = [0u8; 1024];
    loop {
        let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        if let Some(Ok(value)) = values.next() {
            let consumed = values.byte_offset();
            buf.drain(..consumed);
            let name = value["execute"].as_str().unwrap_or_default().to_string();
            return Ok(Some(name));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    message: &Value,
    split: bool,
) -> std::io::Result<()> {
    write_bytes(writer, format!("{message}\r\n").as_bytes(), split).await
}

async fn write_bytes(
    writer: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
    split: bool,
) -> std::io::Result<()> {
    if split {
        let (head, tail) = data.split_at(data.len() / 2);
        writer.write_all(head).await?;
        writer.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(tail).await?;
    } else {
        writer.write_all(data).await?;
    }
    writer.flush().await
}

/// Fake guest SSH endpoint: sends a banner on every accepted connection.
pub(crate) struct FakeGuest {
    port: u16,
    task: JoinHandle<()>,
}

impl FakeGuest {
    /// Bind `port` (0 for any) on loopback and start serving banners.
    pub async fn start(port: u16) -> Self {
        Self::start_after(port, 0).await
    }

    /// Like `start`, but the first `silent` connections are closed without
    /// a banner, as QEMU's user-mode forwarder does before the guest is up.
    pub async fn start_after(port: u16, silent: usize) -> Self {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut seen = 0usize;
            while let Ok((mut stream, _)) = listener.accept().await {
                seen += 1;
                if seen <= silent {
                    drop(stream);
                    continue;
                }
                let _ = stream.write_all(SSH_BANNER).await;
            }
        });
        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for FakeGuest {
    fn drop(&mut self) {
        self.task.abort();
    }
}
