//! Chat transport: the message source the ingestion loop polls, and a
//! signal-cli-rest-api implementation of it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::error::{PinError, Result};

/// One inbound text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Stable per message: sender plus send timestamp.
    pub id: String,
    pub sender: String,
    /// Sender's timestamp, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub body: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Messages received since the previous call. May repeat messages after a
    /// restart; the ingestion cursor filters those.
    async fn fetch_new_messages(&self) -> Result<Vec<ChatMessage>>;

    async fn send_message(&self, recipient: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ReceivedItem {
    envelope: Envelope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    source: Option<String>,
    source_number: Option<String>,
    timestamp: i64,
    data_message: Option<DataMessage>,
}

#[derive(Debug, Deserialize)]
struct DataMessage {
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    message: &'a str,
    number: &'a str,
    recipients: [&'a str; 1],
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for signal-cli-rest-api. Every request is bounded by
/// `request_timeout`; an expired deadline is a transport error.
pub struct SignalClient {
    http: Client,
    base_url: String,
    account: OnceCell<String>,
    request_timeout: Duration,
}

impl SignalClient {
    /// `number` pins the bot account; when `None` the first registered
    /// account is looked up on first use.
    pub fn new(base_url: &str, number: Option<String>) -> Self {
        let account = match number {
            Some(n) => OnceCell::new_with(Some(n)),
            None => OnceCell::new(),
        };
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            account,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PinError::Transport {
                reason: format!("{what} timed out after {:?}", self.request_timeout),
            }),
        }
    }

    /// The bot's own number.
    pub async fn account(&self) -> Result<&str> {
        let number = self
            .account
            .get_or_try_init(|| {
                self.bounded("account lookup", async {
                    let url = format!("{}/v1/accounts", self.base_url);
                    let accounts: Vec<String> = self
                        .http
                        .get(&url)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(transport)?
                        .json()
                        .await
                        .map_err(transport)?;
                    accounts.into_iter().next().ok_or_else(|| PinError::Transport {
                        reason: "no registered signal accounts".into(),
                    })
                })
            })
            .await?;
        Ok(number.as_str())
    }
}

fn transport(e: reqwest::Error) -> PinError {
    PinError::Transport {
        reason: e.to_string(),
    }
}

#[async_trait]
impl ChatTransport for SignalClient {
    async fn fetch_new_messages(&self) -> Result<Vec<ChatMessage>> {
        let number = self.account().await?;
        let url = format!("{}/v1/receive/{}", self.base_url, number);
        let items: Vec<ReceivedItem> = self
            .bounded("receive", async {
                self.http
                    .get(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(transport)?
                    .json()
                    .await
                    .map_err(transport)
            })
            .await?;

        Ok(items
            .into_iter()
            .filter_map(|item| {
                let env = item.envelope;
                let body = env.data_message?.message?;
                let sender = env.source_number.or(env.source)?;
                Some(ChatMessage {
                    id: format!("{}:{}", sender, env.timestamp),
                    sender,
                    timestamp: env.timestamp,
                    body,
                })
            })
            .collect())
    }

    async fn send_message(&self, recipient: &str, text: &str) -> Result<()> {
        let number = self.account().await?;
        let url = format!("{}/v2/send", self.base_url);
        let request = self.http.post(&url).json(&SendRequest {
            message: text,
            number,
            recipients: [recipient],
        });
        self.bounded("send", async {
            request
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(transport)?;
            Ok(())
        })
        .await
    }
}
