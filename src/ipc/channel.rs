//! Per-session request bookkeeping and the directory-exchange transport.
//!
//! Layout of a session's IPC directory (mounted into the sandbox):
//!
//! ```text
//! {ipc_dir}/requests/{request_id}.json    # written by the sandbox
//! {ipc_dir}/responses/{request_id}.json   # written by the host (atomic rename)
//! {ipc_dir}/processed/{request_id}.json   # consumed requests, kept for audit
//! ```
//!
//! Files ending in anything but `.json` (e.g. `.tmp` while the sandbox is
//! still writing) are ignored.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use super::{IpcError, IpcRequest, IpcResponse};

/// Longest accepted request id. Ids become file names.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Where a request came from, which decides where its answer goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Stdio,
    Directory,
}

/// Tracks which request ids a session has used and the responses sent
/// for them. Each id is claimed exactly once; responses stay readable
/// for the lifetime of the session.
pub struct IpcChannel {
    claimed: HashSet<String>,
    responses: HashMap<String, IpcResponse>,
    exchange: Option<DirectoryExchange>,
}

impl IpcChannel {
    pub fn new(exchange: Option<DirectoryExchange>) -> Self {
        Self {
            claimed: HashSet::new(),
            responses: HashMap::new(),
            exchange,
        }
    }

    pub fn has_exchange(&self) -> bool {
        self.exchange.is_some()
    }

    pub fn is_claimed(&self, request_id: &str) -> bool {
        self.claimed.contains(request_id)
    }

    /// Claims a request id. Reusing an id within the session, or an id
    /// that is not a safe file name, is a protocol violation.
    pub fn claim(&mut self, request_id: &str) -> Result<(), IpcError> {
        validate_request_id(request_id)?;
        if !self.claimed.insert(request_id.to_string()) {
            return Err(IpcError::ProtocolViolation(format!(
                "request id `{request_id}` was already used in this session"
            )));
        }
        Ok(())
    }

    /// Records the response and publishes it on the request's transport.
    /// A second completion for the same id keeps the first response.
    pub async fn complete(&mut self, origin: RequestOrigin, response: IpcResponse) -> Result<()> {
        if self.responses.contains_key(&response.request_id) {
            warn!(
                "Response for IPC request {} already recorded, keeping the first one",
                response.request_id
            );
            return Ok(());
        }
        if origin == RequestOrigin::Directory {
            if let Some(exchange) = &self.exchange {
                exchange.write_response(&response).await?;
            }
        }
        self.responses.insert(response.request_id.clone(), response);
        Ok(())
    }

    /// Idempotent read of a completed response.
    pub fn response(&self, request_id: &str) -> Option<&IpcResponse> {
        self.responses.get(request_id)
    }

    /// Picks up new requests from the directory exchange.
    ///
    /// Each entry is either a parsed request, or the id of a file that
    /// could not be parsed together with the violation to answer it with.
    pub async fn poll_directory(&mut self) -> Vec<Result<IpcRequest, (String, IpcError)>> {
        let Some(exchange) = &self.exchange else {
            return Vec::new();
        };

        let pending = match exchange.pending_requests().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Cannot scan IPC request directory: {e}");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(pending.len());
        for (id, path) in pending {
            match exchange.take_request(&id, &path).await {
                Ok(request) if request.request_id == id => out.push(Ok(request)),
                Ok(request) => out.push(Err((
                    id.clone(),
                    IpcError::ProtocolViolation(format!(
                        "file {id}.json carries request id `{}`",
                        request.request_id
                    )),
                ))),
                Err(e) => out.push(Err((id, e))),
            }
        }
        out
    }
}

fn validate_request_id(request_id: &str) -> Result<(), IpcError> {
    let valid = !request_id.is_empty()
        && request_id.len() <= MAX_REQUEST_ID_LEN
        && !request_id.starts_with('.')
        && request_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(IpcError::ProtocolViolation(format!(
            "invalid request id `{request_id}`"
        )))
    }
}

/// Filesystem transport rooted at a session's IPC directory.
pub struct DirectoryExchange {
    root: PathBuf,
}

impl DirectoryExchange {
    /// Creates the directory layout if needed.
    pub async fn create(root: &Path) -> std::io::Result<Self> {
        for sub in ["requests", "responses", "processed"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Request files ready to be consumed, sorted by id.
    async fn pending_requests(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(self.root.join("requests")).await?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Moves a request file out of `requests/` and parses it. A file
    /// reusing a consumed id is discarded; the first one stays in
    /// `processed/`.
    async fn take_request(&self, id: &str, path: &Path) -> Result<IpcRequest, IpcError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| IpcError::ProtocolViolation(format!("unreadable request file: {e}")))?;

        let processed = self.root.join("processed").join(format!("{id}.json"));
        if tokio::fs::try_exists(&processed).await.unwrap_or(false) {
            warn!("IPC request file {id}.json reuses a consumed id, discarding it");
            let _ = tokio::fs::remove_file(path).await;
            return Err(IpcError::ProtocolViolation(format!(
                "request id `{id}` was already used in this session"
            )));
        }
        if let Err(e) = tokio::fs::rename(path, &processed).await {
            // Remove it anyway so the same file is not consumed twice
            warn!("Cannot move IPC request {id} to processed/: {e}");
            let _ = tokio::fs::remove_file(path).await;
        }
        debug!("Consumed IPC request file {id}.json");

        serde_json::from_str(&content)
            .map_err(|e| IpcError::ProtocolViolation(format!("malformed request payload: {e}")))
    }

    /// Writes a response atomically: temp file first, then rename.
    pub async fn write_response(&self, response: &IpcResponse) -> Result<()> {
        let dir = self.root.join("responses");
        let tmp = dir.join(format!("{}.json.tmp", response.request_id));
        let target = dir.join(format!("{}.json", response.request_id));
        let body = serde_json::to_vec(response)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Reads a published response. Reading never consumes it.
    #[cfg(test)]
    pub async fn read_response(&self, request_id: &str) -> Result<Option<IpcResponse>> {
        let path = self.root.join("responses").join(format!("{request_id}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
