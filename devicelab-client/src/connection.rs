//! Client-side connection management
//!
//! Wraps the framed transport client with a reconnection policy and typed
//! helpers for the common requests.

use devicelab_common::{
    Device, Envelope, Event, LabClient, LabError, Request, Result, Session,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Connection state for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// A connection to the lab with reconnect support
pub struct LabConnection {
    addr: String,
    client: Option<LabClient>,
    policy: ReconnectPolicy,
}

impl LabConnection {
    /// Connect, retrying per the reconnect policy
    pub async fn connect(addr: &str, policy: ReconnectPolicy) -> Result<Self> {
        let mut delay = policy.initial_delay;
        let mut last_err = None;
        for attempt in 1..=policy.max_attempts {
            match LabClient::connect(addr).await {
                Ok(client) => {
                    info!("Connected to {} (attempt {})", addr, attempt);
                    return Ok(Self {
                        addr: addr.to_string(),
                        client: Some(client),
                        policy,
                    });
                }
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, addr, e);
                    last_err = Some(e);
                    if attempt < policy.max_attempts {
                        sleep(delay).await;
                        let next = delay.as_secs_f64() * policy.backoff_multiplier;
                        delay = Duration::from_secs_f64(next.min(policy.max_delay.as_secs_f64()));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| LabError::network(format!("could not reach {}", addr))))
    }

    pub fn state(&self) -> ConnectionState {
        if self.client.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn client(&self) -> Result<&LabClient> {
        self.client
            .as_ref()
            .ok_or_else(|| LabError::network("not connected"))
    }

    /// Issue a raw request and return the envelope
    pub async fn request(&self, request: Request) -> Result<Envelope> {
        self.client()?.request(request).await
    }

    /// Issue a request and decode the envelope payload, failing on error
    /// envelopes with their server-provided message
    pub async fn request_data<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T> {
        let envelope = self.request(request).await?;
        if !envelope.success {
            return Err(LabError::server(
                envelope.error.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| LabError::server("response carried no data"))?;
        serde_json::from_value(data).map_err(LabError::from)
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.request_data(Request::ListDevices).await
    }

    pub async fn sessions(&self) -> Result<Vec<Session>> {
        self.request_data(Request::ListSessions).await
    }

    /// Receive the next broadcast event
    pub async fn next_event(&mut self) -> Option<Event> {
        match self.client.as_mut() {
            Some(client) => client.next_event().await,
            None => None,
        }
    }
}
