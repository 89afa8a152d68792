// Stdio JSON-RPC Transport
// Line-framed transport for agent processes. Framing is auto-detected from
// the first bytes of the connection, newline-delimited JSON or
// `Content-Length:` framed, and never mixed afterwards. All responses go
// through one writer guarded by a mutex, so a framed message is always
// contiguous on the wire. Logs go to stderr; stdout belongs to the
// protocol.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::{BufRead, Read, Write};
use std::sync::Arc;

use crate::daemon::{ControllerHandle, LifecycleEvent};
use crate::tools::envelope::to_pack;
use crate::tools::ToolRegistry;

/// Wire framing, fixed per connection after detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Ndjson,
    ContentLength,
}

/// Detect framing from the first bytes of a connection.
pub fn detect_framing(first_bytes: &[u8]) -> Framing {
    let prefix = String::from_utf8_lossy(&first_bytes[..first_bytes.len().min(32)]);
    if prefix
        .to_ascii_lowercase()
        .starts_with("content-length")
    {
        Framing::ContentLength
    } else {
        Framing::Ndjson
    }
}

/// Framed message reader. The first message locks the framing in.
pub struct FrameReader<R: BufRead> {
    inner: R,
    framing: Option<Framing>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            framing: None,
        }
    }

    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Read the next message, or None at EOF.
    pub fn read_message(&mut self) -> Result<Option<String>> {
        let framing = match self.framing {
            Some(framing) => framing,
            None => {
                let detected = detect_framing(self.inner.fill_buf()?);
                self.framing = Some(detected);
                detected
            }
        };
        match framing {
            Framing::Ndjson => self.read_line_message(),
            Framing::ContentLength => self.read_framed_message(),
        }
    }

    fn read_line_message(&mut self) -> Result<Option<String>> {
        loop {
            let mut line = String::new();
            let read = self.inner.read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    fn read_framed_message(&mut self) -> Result<Option<String>> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read = self.inner.read_line(&mut line)?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((name, value)) = trimmed.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = Some(
                        value
                            .trim()
                            .parse()
                            .context("malformed Content-Length header")?,
                    );
                }
            }
        }
        let length = match content_length {
            Some(length) => length,
            None => bail!("framed message missing Content-Length"),
        };
        let mut body = vec![0u8; length];
        self.inner
            .read_exact(&mut body)
            .context("truncated framed message")?;
        Ok(Some(String::from_utf8_lossy(&body).to_string()))
    }
}

/// Serialized frame writer: one message is one contiguous write.
pub struct FrameWriter<W: Write> {
    inner: Mutex<W>,
    framing: Framing,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing) -> Self {
        Self {
            inner: Mutex::new(inner),
            framing,
        }
    }

    pub fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.inner.lock();
        match self.framing {
            Framing::Ndjson => {
                writer.write_all(message.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            Framing::ContentLength => {
                write!(writer, "Content-Length: {}\r\n\r\n", message.len())?;
                writer.write_all(message.as_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Handle one JSON-RPC request and produce the response document.
pub async fn handle_request(
    tools: &ToolRegistry,
    controller: &ControllerHandle,
    client_id: &str,
    request: &Value,
) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    controller.send(LifecycleEvent::LeaseRenew {
        client_id: client_id.to_string(),
    });
    let _in_flight = controller.begin_request();

    let result = match method {
        "initialize" => {
            let ctx = tools.context();
            json!({
                "serverInfo": { "name": "sari", "version": ctx.version },
                "capabilities": { "tools": {} },
                "boot_id": ctx.boot_id.as_str(),
            })
        }
        "ping" => json!({ "status": "ok" }),
        "shutdown" => {
            controller.send(LifecycleEvent::ShutdownRequest);
            json!({ "stopping": true })
        }
        "tools/list" => json!({ "tools": tools.tool_names() }),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(json!({}));
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            run_tool(tools, &name, args, client_id).await
        }
        // Direct tool invocation: method is the tool name.
        tool => {
            let args = request.get("params").cloned().unwrap_or(json!({}));
            run_tool(tools, tool, args, client_id).await
        }
    };

    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

async fn run_tool(tools: &ToolRegistry, name: &str, args: Value, session: &str) -> Value {
    let wants_pack = args.get("format").and_then(Value::as_str) == Some("pack");
    let envelope = tools.execute(name, args, session).await;
    if wants_pack {
        json!({ "pack": to_pack(&envelope) })
    } else {
        envelope
    }
}

/// Serve stdio until EOF. Runs on a dedicated thread; async tool calls are
/// bridged through the provided runtime handle.
pub fn run_stdio_server(
    tools: Arc<ToolRegistry>,
    controller: ControllerHandle,
    runtime: tokio::runtime::Handle,
) -> Result<()> {
    let stdin = std::io::stdin();
    let mut reader = FrameReader::new(stdin.lock());
    let client_id = format!("stdio:{}", std::process::id());
    controller.send(LifecycleEvent::LeaseIssue {
        client_id: client_id.clone(),
    });

    let mut writer: Option<FrameWriter<std::io::Stdout>> = None;
    while let Some(raw) = reader.read_message()? {
        let framing = reader.framing().unwrap_or(Framing::Ndjson);
        let writer =
            writer.get_or_insert_with(|| FrameWriter::new(std::io::stdout(), framing));

        let request: Value = match serde_json::from_str(&raw) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable request skipped");
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("parse error: {err}") },
                });
                writer.write_message(&response.to_string())?;
                continue;
            }
        };

        let response =
            runtime.block_on(handle_request(&tools, &controller, &client_id, &request));
        writer.write_message(&response.to_string())?;
    }

    controller.send(LifecycleEvent::ConnClosed { client_id });
    Ok(())
}
