//! Ingestion loop: polls the chat transport, pins every CID it sees and
//! tells the sender how it went.
//!
//! The cursor is the only state carried between polls. It lives in the
//! store's `local_state` table so a restart does not reprocess messages that
//! were already handled. Replays that slip through are harmless: observing a
//! live CID only refreshes its window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::cache::ContentCache;
use crate::cid::{self, Cid};
use crate::error::{PinError, Result};
use crate::pin::{PinEngine, PinRecord, PinSource, PinStore};
use crate::signal::{ChatMessage, ChatTransport};

const CURSOR_KEY: &str = "ingest_cursor";

/// How many processed message ids the cursor remembers.
pub const RECENT_IDS_CAPACITY: usize = 4096;

/// Marker of processed messages.
///
/// Deduplication is by message id only. Sender timestamps come from the
/// sender's device and a late or clock-skewed message can carry an older
/// timestamp than one already handled, so timestamp order never filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestCursor {
    /// Newest sender timestamp seen. Informational.
    pub last_timestamp: i64,
    /// Ids of recently processed messages, oldest first.
    pub recent_ids: VecDeque<String>,
}

impl IngestCursor {
    /// Load from the store; a missing or unreadable cursor starts empty.
    pub fn load(store: &PinStore) -> Result<Self> {
        let Some(raw) = store.get_state(CURSOR_KEY)? else {
            return Ok(Self::default());
        };
        match serde_json::from_str(&raw) {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable ingest cursor, starting fresh");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, store: &PinStore) -> Result<()> {
        store.set_state(CURSOR_KEY, &serde_json::to_string(self)?)
    }

    pub fn is_new(&self, msg: &ChatMessage) -> bool {
        !self.recent_ids.contains(&msg.id)
    }

    pub fn advance(&mut self, msg: &ChatMessage) {
        self.last_timestamp = self.last_timestamp.max(msg.timestamp);
        if self.is_new(msg) {
            self.recent_ids.push_back(msg.id.clone());
        }
        while self.recent_ids.len() > RECENT_IDS_CAPACITY {
            self.recent_ids.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub fetch_interval: Duration,
    pub pin_duration: chrono::Duration,
    pub reply_to_sender: bool,
}

/// Outcome counts for one poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub messages: usize,
    pub pinned: usize,
    pub failed: usize,
}

pub struct Ingestor {
    engine: PinEngine,
    transport: Arc<dyn ChatTransport>,
    cache: Option<ContentCache>,
    settings: IngestSettings,
    cursor: IngestCursor,
}

impl Ingestor {
    /// Build an ingestor, restoring the cursor from the engine's store.
    pub async fn new(
        engine: PinEngine,
        transport: Arc<dyn ChatTransport>,
        settings: IngestSettings,
    ) -> Result<Self> {
        let store = engine.store().clone();
        let cursor = tokio::task::spawn_blocking(move || IngestCursor::load(&store))
            .await
            .map_err(|e| PinError::store(format!("cursor load task failed: {e}")))??;
        let cache = engine.cache().cloned();
        Ok(Self {
            engine,
            transport,
            cache,
            settings,
            cursor,
        })
    }

    pub fn cursor(&self) -> &IngestCursor {
        &self.cursor
    }

    /// Fetch once, handle every unseen message, persist the cursor.
    pub async fn poll_once(&mut self) -> Result<BatchSummary> {
        let mut messages = self.transport.fetch_new_messages().await?;
        messages.sort_by_key(|m| m.timestamp);

        let mut summary = BatchSummary::default();
        for msg in messages {
            if !self.cursor.is_new(&msg) {
                tracing::debug!(id = %msg.id, "skipping already processed message");
                continue;
            }
            summary.messages += 1;
            for cid in cid::extract(&msg.body) {
                if self.handle_cid(&msg, &cid).await {
                    summary.pinned += 1;
                } else {
                    summary.failed += 1;
                }
            }
            self.cursor.advance(&msg);
        }

        if summary.messages > 0 {
            let store = self.engine.store().clone();
            let cursor = self.cursor.clone();
            tokio::task::spawn_blocking(move || cursor.save(&store))
                .await
                .map_err(|e| PinError::store(format!("cursor save task failed: {e}")))??;
        }
        Ok(summary)
    }

    /// Returns whether the CID ended up pinned.
    async fn handle_cid(&self, msg: &ChatMessage, cid: &Cid) -> bool {
        let result = self
            .engine
            .observe_for(cid, PinSource::Chat, self.settings.pin_duration, &msg.sender)
            .await;

        let (pinned, reply) = match &result {
            Ok(record) => {
                self.schedule_download(record);
                (true, pinned_reply(record))
            }
            Err(e) => {
                tracing::warn!(cid = %cid, sender = %msg.sender, error = %e, "failed to pin");
                (false, format!("Failed to pin {cid}: {e}"))
            }
        };

        if self.settings.reply_to_sender {
            if let Err(e) = self.transport.send_message(&msg.sender, &reply).await {
                tracing::warn!(recipient = %msg.sender, error = %e, "reply failed");
            }
        }
        pinned
    }

    fn schedule_download(&self, record: &PinRecord) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if record.downloaded {
            return;
        }
        let engine = self.engine.clone();
        let cid = record.cid.clone();
        tokio::spawn(async move {
            download_and_mark(&engine, &cache, &cid).await;
        });
    }
}

pub fn pinned_reply(record: &PinRecord) -> String {
    format!(
        "Pinned {} until {}",
        record.cid,
        record.expires_at.format("%Y-%m-%d %H:%M UTC")
    )
}

/// Download into the cache and flag the record; drop the file again if the
/// pin went away meanwhile.
pub async fn download_and_mark(engine: &PinEngine, cache: &ContentCache, cid: &Cid) {
    match cache.download(engine.remote().as_ref(), cid).await {
        Ok(bytes) => {
            tracing::info!(cid = %cid, bytes, "downloaded to cache");
            match engine.mark_downloaded(cid).await {
                Ok(_) => {}
                Err(PinError::NotFound { .. }) => {
                    let _ = cache.remove(cid);
                }
                Err(e) => tracing::warn!(cid = %cid, error = %e, "could not mark downloaded"),
            }
        }
        Err(e) => tracing::warn!(cid = %cid, error = %e, "download failed"),
    }
}

/// Poll forever. Failed polls add jittered backoff on top of the interval.
pub async fn run_ingest_loop(mut ingestor: Ingestor) {
    let interval = ingestor.settings.fetch_interval;
    let mut backoff = Backoff::for_fetch(interval);
    loop {
        match ingestor.poll_once().await {
            Ok(summary) => {
                backoff.reset();
                if summary.messages > 0 {
                    tracing::info!(
                        messages = summary.messages,
                        pinned = summary.pinned,
                        failed = summary.failed,
                        "processed chat messages"
                    );
                }
            }
            Err(e) => {
                let extra = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    failures = backoff.attempt(),
                    backoff_ms = extra.as_millis() as u64,
                    "message fetch failed"
                );
                tokio::time::sleep(extra).await;
            }
        }
        tokio::time::sleep(interval).await;
    }
}
