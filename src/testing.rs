//! In-process doubles for the remote store and chat transport.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cid::Cid;
use crate::error::{PinError, Result};
use crate::ipfs::RemoteStore;
use crate::signal::{ChatMessage, ChatTransport};

#[derive(Default)]
pub(crate) struct FakeRemote {
    pub pins: AtomicUsize,
    pub unpins: AtomicUsize,
    pub fail_pin: AtomicBool,
    pub fail_unpin: AtomicBool,
    pub delay: Mutex<Duration>,
    pub added: Mutex<Option<Cid>>,
}

impl FakeRemote {
    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn unpins(&self) -> usize {
        self.unpins.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn pin(&self, _cid: &Cid) -> Result<()> {
        self.pins.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_pin.load(Ordering::SeqCst) {
            return Err(PinError::remote("node unreachable"));
        }
        Ok(())
    }

    async fn unpin(&self, _cid: &Cid) -> Result<()> {
        self.unpins.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_unpin.load(Ordering::SeqCst) {
            return Err(PinError::remote("node unreachable"));
        }
        Ok(())
    }

    async fn add_local(&self, _path: &Path) -> Result<Cid> {
        let added = self.added.lock().unwrap().clone();
        added.ok_or_else(|| PinError::remote("add failed"))
    }

    async fn fetch_to(&self, _cid: &Cid, dest: &Path) -> Result<u64> {
        std::fs::write(dest, b"content")?;
        Ok(7)
    }
}

/// Serves queued batches, one per fetch, and records replies.
#[derive(Default)]
pub(crate) struct FakeTransport {
    pub batches: Mutex<Vec<Result<Vec<ChatMessage>>>>,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn push_batch(&self, messages: Vec<ChatMessage>) {
        self.batches.lock().unwrap().push(Ok(messages));
    }

    pub fn push_failure(&self) {
        self.batches.lock().unwrap().push(Err(PinError::Transport {
            reason: "connection refused".into(),
        }));
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn fetch_new_messages(&self) -> Result<Vec<ChatMessage>> {
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        batches.remove(0)
    }

    async fn send_message(&self, recipient: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}

pub(crate) fn message(sender: &str, timestamp: i64, body: &str) -> ChatMessage {
    ChatMessage {
        id: format!("{sender}:{timestamp}"),
        sender: sender.to_string(),
        timestamp,
        body: body.to_string(),
    }
}
