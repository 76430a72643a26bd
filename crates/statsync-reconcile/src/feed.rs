//! Redis pub/sub change feed.
//!
//! The registry publishes one JSON message per change on a single channel.
//! [`RedisChangeFeed::subscribe`] joins it; the returned
//! [`ChangeSubscription`] forwards every message, decoded or not, to the
//! [`EventListener`](crate::listener::EventListener) channel.
//! Delivery is whatever Redis pub/sub provides: messages published while
//! no subscription is open are lost. A full resync restores associations
//! of sensors still in the registry, but not rows of sensors deleted in
//! that window.

use crate::Result;
use crate::listener::FeedItem;
use futures::StreamExt;
use statsync_core::ChangeEvent;
use tokio::sync::mpsc;

/// Subscriber for the registry change channel.
pub struct RedisChangeFeed {
    client: redis::Client,
    channel: String,
}

impl RedisChangeFeed {
    /// Create a feed for `channel` on the Redis server at `url`.
    ///
    /// Nothing connects until [`RedisChangeFeed::subscribe`].
    pub fn new(url: &str, channel: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe to the change channel.
    ///
    /// Redis does not buffer messages for absent subscribers, so subscribe
    /// before any work whose changes must not be missed.
    pub async fn subscribe(&self) -> Result<ChangeSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, "subscribed to change feed");
        Ok(ChangeSubscription { pubsub })
    }
}

/// An established subscription to the change channel.
pub struct ChangeSubscription {
    pubsub: redis::aio::PubSub,
}

impl ChangeSubscription {
    /// Forward messages into `sender`.
    ///
    /// Returns `Ok` once the listener side of the channel is dropped, or an
    /// error if the connection ends.
    pub async fn forward(mut self, sender: mpsc::Sender<FeedItem>) -> Result<()> {
        let mut messages = self.pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let item = match msg.get_payload::<String>() {
                Ok(payload) => decode(&payload),
                Err(e) => {
                    tracing::warn!(error = %e, "change message payload is not a string");
                    continue;
                }
            };

            if sender.send(item).await.is_err() {
                tracing::info!("event listener gone, closing change feed");
                return Ok(());
            }
        }

        Err(crate::Error::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "change feed connection closed",
        ))))
    }
}

/// Decode one pub/sub payload.
pub fn decode(payload: &str) -> FeedItem {
    let decoded = ChangeEvent::from_json(payload);
    if let Err(e) = &decoded {
        tracing::debug!(error = %e, payload, "undecodable change message");
    }
    decoded
}
