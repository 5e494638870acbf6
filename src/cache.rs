//! Local content cache: one tar archive per CID in the download directory,
//! so directory CIDs are cached the same way as single files.

use std::io;
use std::path::{Path, PathBuf};

use crate::cid::Cid;
use crate::error::Result;
use crate::ipfs::RemoteStore;

#[derive(Debug, Clone)]
pub struct ContentCache {
    dir: PathBuf,
}

impl ContentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, cid: &Cid) -> PathBuf {
        self.dir.join(format!("{cid}.tar"))
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.path_for(cid).is_file()
    }

    /// Fetch `cid` from the remote store into the cache. Returns bytes written.
    pub async fn download(&self, remote: &dyn RemoteStore, cid: &Cid) -> Result<u64> {
        tokio::fs::create_dir_all(&self.dir).await?;
        remote.fetch_to(cid, &self.path_for(cid)).await
    }

    /// Delete the cached copy. Returns whether a file was removed.
    pub fn remove(&self, cid: &Cid) -> Result<bool> {
        match std::fs::remove_file(self.path_for(cid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
