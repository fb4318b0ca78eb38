//! HTTP client for the state-machine relay

use gg18_core::mpc::{async_trait, Relay};
use gg18_core::{Error, PartyId, Result, SessionId};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use sm_relay::wire::{GetMessageRequest, MessageResponse, PostMessageRequest};
use sm_relay::MessageId;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const POST_RETRIES: usize = 3;

/// HTTP-based relay client
pub struct RelayClient {
    client: Client,
    /// Relay service URL
    url: String,
    /// Request timeout
    timeout: Duration,
    poll_interval: Duration,
    max_polls: usize,
}

impl RelayClient {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            max_polls: 1200,
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay between polls and how many polls to make before giving up
    pub fn with_polling(mut self, interval: Duration, max_polls: usize) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    /// Post a message, retrying transport failures and server errors
    #[instrument(skip(self, payload), fields(round = id.round, from = id.from, to = ?id.to))]
    async fn post_message(&self, id: MessageId, payload: &[u8]) -> Result<()> {
        let req = PostMessageRequest::new(id, payload);
        let mut last_error = String::new();

        for attempt in 1..=POST_RETRIES {
            let response = self
                .client
                .post(format!("{}/v1/msg", self.url))
                .json(&req)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    debug!("Message posted");
                    return Ok(());
                }
                Ok(response) if response.status() == StatusCode::CONFLICT => {
                    return Err(Error::Relay(
                        "relay holds a different message for this slot".into(),
                    ));
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(Error::Relay(format!(
                        "POST rejected with status: {}",
                        response.status()
                    )));
                }
                Ok(response) => last_error = format!("status {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }

            warn!(attempt, error = %last_error, "Relay POST failed");
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(Error::Relay(format!(
            "POST failed after {} attempts: {}",
            POST_RETRIES, last_error
        )))
    }

    /// Fetch a message if the relay has it
    async fn get_message(&self, id: &MessageId) -> Result<Option<Vec<u8>>> {
        let req = GetMessageRequest { id: id.clone() };

        let response = self
            .client
            .post(format!("{}/v1/msg/get", self.url))
            .json(&req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Relay(format!(
                "GET failed with status: {}",
                response.status()
            )));
        }

        let msg_response: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;

        msg_response
            .decode_payload()
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Poll until every slot is filled, returning payloads in slot order
    async fn collect<T: DeserializeOwned>(&self, ids: Vec<MessageId>) -> Result<Vec<T>> {
        let mut payloads: Vec<Option<Vec<u8>>> = vec![None; ids.len()];

        for _ in 0..self.max_polls {
            for (id, slot) in ids.iter().zip(payloads.iter_mut()) {
                if slot.is_none() {
                    *slot = self.get_message(id).await?;
                }
            }

            if payloads.iter().all(Option::is_some) {
                return payloads
                    .into_iter()
                    .flatten()
                    .map(|payload| deserialize(&payload))
                    .collect();
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let missing: Vec<PartyId> = ids
            .iter()
            .zip(&payloads)
            .filter(|(_, payload)| payload.is_none())
            .map(|(id, _)| id.from)
            .collect();
        Err(Error::Timeout(format!(
            "messages from parties {:?} in round {}",
            missing,
            ids.first().map(|id| id.round).unwrap_or_default()
        )))
    }
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

#[async_trait]
impl Relay for RelayClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn broadcast<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        message: &T,
    ) -> Result<()> {
        let payload = serialize(message)?;
        let id = MessageId::broadcast(&session_id.to_string(), round, from);
        self.post_message(id, &payload).await
    }

    async fn send_direct<T: Serialize + Send + Sync>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: PartyId,
        to: PartyId,
        message: &T,
    ) -> Result<()> {
        let payload = serialize(message)?;
        let id = MessageId::direct(&session_id.to_string(), round, from, to);
        self.post_message(id, &payload).await
    }

    async fn collect_broadcasts<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        from: &[PartyId],
    ) -> Result<Vec<T>> {
        let session = session_id.to_string();
        let ids = from
            .iter()
            .map(|sender| MessageId::broadcast(&session, round, *sender))
            .collect();
        self.collect(ids).await
    }

    async fn collect_direct<T: DeserializeOwned + Send>(
        &self,
        session_id: &SessionId,
        round: u32,
        to: PartyId,
        from: &[PartyId],
    ) -> Result<Vec<T>> {
        let session = session_id.to_string();
        let ids = from
            .iter()
            .map(|sender| MessageId::direct(&session, round, *sender, to))
            .collect();
        self.collect(ids).await
    }
}
