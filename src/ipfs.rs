//! Remote content store: the contract the engine pins through, and a Kubo
//! RPC implementation of it.
//!
//! Kubo's RPC API is POST-only and reports failures as a non-2xx status with
//! a JSON body `{"Message": ..., "Code": ..., "Type": "error"}`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::cid::Cid;
use crate::error::{PinError, Result};

/// What the lifecycle engine needs from a content store.
///
/// Every call is idempotent from the caller's point of view: pinning a pinned
/// CID and unpinning an unpinned one both succeed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn pin(&self, cid: &Cid) -> Result<()>;

    /// Remove the pin. A CID the node does not have pinned counts as success.
    async fn unpin(&self, cid: &Cid) -> Result<()>;

    /// Add a local file and return its CID.
    async fn add_local(&self, path: &Path) -> Result<Cid>;

    /// Stream `cid` into `dest` as a tar archive, returning the byte count.
    /// Works for single files and directories alike.
    async fn fetch_to(&self, cid: &Cid, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct KuboError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct PinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FilesStatResponse {
    #[serde(rename = "CumulativeSize")]
    cumulative_size: u64,
}

/// Client for a Kubo node's RPC API (`/api/v0`).
#[derive(Clone)]
pub struct IpfsClient {
    http: Client,
    base_url: String,
}

impl IpfsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, command)
    }

    async fn call(&self, command: &str, query: &[(&str, &str)]) -> Result<Response> {
        let response = self
            .http
            .post(self.endpoint(command))
            .query(query)
            .send()
            .await
            .map_err(|e| PinError::remote(format!("{command}: {e}")))?;
        check_status(command, response).await
    }

    /// Recursive pins currently held by the node.
    pub async fn list_pins(&self) -> Result<BTreeSet<Cid>> {
        let response = self.call("pin/ls", &[("type", "recursive")]).await?;
        let body: PinLsResponse = response
            .json()
            .await
            .map_err(|e| PinError::remote(format!("pin/ls: {e}")))?;
        Ok(body
            .keys
            .into_keys()
            .filter_map(|key| Cid::parse(&key).ok())
            .collect())
    }

    /// Total size in bytes of the DAG under `cid`.
    pub async fn content_size(&self, cid: &Cid) -> Result<u64> {
        let arg = format!("/ipfs/{cid}");
        let response = self.call("files/stat", &[("arg", arg.as_str())]).await?;
        let body: FilesStatResponse = response
            .json()
            .await
            .map_err(|e| PinError::remote(format!("files/stat: {e}")))?;
        Ok(body.cumulative_size)
    }
}

async fn check_status(command: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<KuboError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(PinError::remote(format!("{command}: HTTP {status}: {message}")))
}

fn is_not_pinned(err: &PinError) -> bool {
    match err {
        PinError::Remote { reason } => reason.contains("not pinned"),
        _ => false,
    }
}

#[async_trait]
impl RemoteStore for IpfsClient {
    async fn pin(&self, cid: &Cid) -> Result<()> {
        self.call("pin/add", &[("arg", cid.as_str())]).await?;
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        match self.call("pin/rm", &[("arg", cid.as_str())]).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_pinned(&e) => {
                tracing::debug!(cid = %cid, "node reports not pinned, treating as unpinned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_local(&self, path: &Path) -> Result<Cid> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .http
            .post(self.endpoint("add"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PinError::remote(format!("add: {e}")))?;
        let response = check_status("add", response).await?;
        let body: AddResponse = response
            .json()
            .await
            .map_err(|e| PinError::remote(format!("add: {e}")))?;
        Cid::parse(&body.hash)
            .map_err(|_| PinError::remote(format!("add: node returned invalid CID '{}'", body.hash)))
    }

    async fn fetch_to(&self, cid: &Cid, dest: &Path) -> Result<u64> {
        let response = self
            .call("get", &[("arg", cid.as_str()), ("archive", "true")])
            .await?;

        // Write beside the destination, then rename, so a partial download
        // never looks like a cached copy.
        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(PinError::remote(format!("get: {e}")));
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}
