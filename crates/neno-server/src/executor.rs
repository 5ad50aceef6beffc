//! Model-daemon executor: fulfils the engine's transformer contract by
//! bridging to an external model process over a Unix socket.
//!
//! Frames are length-prefixed JSON: a big-endian u32 byte count followed
//! by the payload. The daemon owns the weights and kernels; this side
//! sends token windows plus the block table and gets logits back.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use neno_core::engine::{Logits, ModelExecutor, Sequence, TokenId};
use neno_core::{Error, Result};

#[derive(Debug, Deserialize)]
struct DaemonInfo {
    eos_token_id: TokenId,
    vocab_size: usize,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    command: &'static str,
    tokens: &'a [TokenId],
    start_pos: usize,
    sequence_id: i64,
    blocks: &'a [usize],
}

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    #[serde(default)]
    logits: Vec<Logits>,
    #[serde(default)]
    error: Option<String>,
}

/// `ModelExecutor` backed by a daemon socket. The connection is reused
/// across calls and re-dialed once on I/O failure.
pub struct DaemonExecutor {
    socket_path: PathBuf,
    conn: Mutex<Option<UnixStream>>,
    eos_token_id: TokenId,
    vocab_size: usize,
}

impl DaemonExecutor {
    /// Connect and interrogate the daemon for its model geometry.
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let mut stream = UnixStream::connect(socket_path).map_err(|e| {
            Error::Engine(format!(
                "failed to connect to model daemon at {:?}: {e}",
                socket_path
            ))
        })?;
        let info: DaemonInfo =
            serde_json::from_value(call_on(&mut stream, &json!({"command": "info"}))?)
                .map_err(|e| Error::Engine(format!("bad daemon info: {e}")))?;
        info!(
            socket = %socket_path.display(),
            model = info.model.as_deref().unwrap_or("unknown"),
            vocab = info.vocab_size,
            "model daemon connected"
        );
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            conn: Mutex::new(Some(stream)),
            eos_token_id: info.eos_token_id,
            vocab_size: info.vocab_size,
        })
    }

    fn call(&self, request: &serde_json::Value) -> Result<serde_json::Value> {
        let mut guard = self.conn.lock().unwrap();
        if let Some(stream) = guard.as_mut() {
            match call_on(stream, request) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(error = %err, "daemon call failed, re-dialing");
                    *guard = None;
                }
            }
        }
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            Error::Engine(format!("model daemon unreachable: {e}"))
        })?;
        let value = call_on(&mut stream, request)?;
        *guard = Some(stream);
        Ok(value)
    }
}

fn call_on(stream: &mut UnixStream, request: &serde_json::Value) -> Result<serde_json::Value> {
    let data = serde_json::to_vec(request)?;
    let length = (data.len() as u32).to_be_bytes();
    stream.write_all(&length)?;
    stream.write_all(&data)?;

    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf)?;
    let response_len = u32::from_be_bytes(length_buf) as usize;

    let mut response_buf = vec![0u8; response_len];
    stream.read_exact(&mut response_buf)?;
    Ok(serde_json::from_slice(&response_buf)?)
}

impl ModelExecutor for DaemonExecutor {
    fn forward(&self, tokens: &[TokenId], start_pos: usize, seq: &Sequence) -> Result<Vec<Logits>> {
        let request = serde_json::to_value(ForwardRequest {
            command: "forward",
            tokens,
            start_pos,
            sequence_id: seq.id,
            blocks: &seq.blocks,
        })?;
        let response: ForwardResponse = serde_json::from_value(self.call(&request)?)
            .map_err(|e| Error::Engine(format!("bad forward response: {e}")))?;
        if let Some(error) = response.error {
            return Err(Error::Engine(error));
        }
        debug!(
            tokens = tokens.len(),
            start_pos,
            sequence_id = seq.id,
            "forward pass complete"
        );
        Ok(response.logits)
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
