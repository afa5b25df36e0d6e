//! Guest calls delivered by running a helper program

use super::{GuestRequest, GuestRpcClient};
use crate::config::GuestConfig;
use crate::error::{Error, Result};
use crate::types::NodeInfo;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// Time allowed to collect output after the helper exits
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Runs `<command> <args..> <node-id> <node-ip> <method>` for every call.
///
/// The request envelope is written to the program's stdin as JSON and its
/// stdout is parsed as the JSON reply (empty output means `null`). A non-zero
/// exit is a guest fault carrying stderr; a program still running when the
/// timeout expires is killed.
#[derive(Debug, Clone)]
pub struct CommandGuestClient {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGuestClient {
    pub fn new(config: &GuestConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
        }
    }

    fn spawn(&self, node: &NodeInfo, request: &GuestRequest) -> Result<Child> {
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(node.id().to_string())
            .arg(&node.ip)
            .arg(request.method.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Written from a thread so a helper that never reads cannot stall the deadline.
        if let Some(mut stdin) = child.stdin.take() {
            let method = request.method.name();
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&payload) {
                    warn!(error = %e, method, "guest helper closed stdin");
                }
            });
        }
        Ok(child)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        let _ = tx.send(out);
    });
    rx
}

impl GuestRpcClient for CommandGuestClient {
    fn call(&self, node: &NodeInfo, request: &GuestRequest, timeout: Duration) -> Result<Value> {
        let method = request.method.name();
        let timed_out = || Error::RpcTimeout {
            node: node.id(),
            method: method.to_string(),
        };

        let start = Instant::now();
        let mut child = self.spawn(node, request)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(timed_out());
            }
            thread::sleep(WAIT_INTERVAL);
        };

        // A descendant of the helper may keep the pipes open after it exits.
        let grace = timeout.saturating_sub(start.elapsed()).max(OUTPUT_GRACE);
        let stdout = stdout.recv_timeout(grace).map_err(|_| timed_out())?;
        let stderr = stderr.recv_timeout(OUTPUT_GRACE).unwrap_or_default();

        if !status.success() {
            return Err(Error::RpcFault {
                node: node.id(),
                method: method.to_string(),
                detail: format!("{}: {}", status, stderr.trim()),
            });
        }

        let reply = stdout.trim();
        if reply.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(reply).map_err(|e| Error::RpcFault {
            node: node.id(),
            method: method.to_string(),
            detail: format!("invalid reply: {}", e),
        })
    }
}
