//! Outbound side of the transport.

use psc_core::Tag;

use crate::transport::message::{Envelope, Message, Reply};

/// Connection to one peer.
///
/// Owned by the agent that sends on it: a parent holds one per child, a
/// child holds one to its parent. Dropping it drops the connection.
#[derive(Debug, Clone)]
pub struct PeerLink {
    http: reqwest::Client,
    base_url: String,
}

impl PeerLink {
    pub fn new(http: reqwest::Client, host: &str, port: u16) -> Self {
        PeerLink {
            http,
            base_url: format!("http://{}:{}", host, port),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Checks that the peer is serving.
    pub async fn probe(&self) -> Result<(), reqwest::Error> {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Delivers `message` and waits for the acknowledgement.
    ///
    /// Returns `Ok(false)` when the peer answered but its inbox is closed.
    pub async fn send(&self, from: &Tag, message: &Message) -> Result<bool, reqwest::Error> {
        let envelope = Envelope {
            from: Some(from.clone()),
            message: message.clone(),
        };
        let reply: Reply = self
            .http
            .post(format!("{}/accl", self.base_url))
            .json(&envelope)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.accepted)
    }
}
