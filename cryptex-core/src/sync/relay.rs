//! Signaling relay seam: an authenticated publish/subscribe bus.
//!
//! The relay brokers offer/answer/ICE exchange only. A [`Subscription`]
//! unsubscribes itself when dropped, so every exit path of a negotiation
//! releases its relay membership.

use crate::sync::auth::SessionToken;
use crate::sync::channel::{IceCandidate, SessionDescription};
use crate::sync::device::RegisteredDevice;
use crate::sync::signaling::Role;
use crate::{CryptexError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use uuid::Uuid;

/// Relay-assigned identity of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    /// First event on every subscription: the other members already present.
    SubscriptionSucceeded { members: Vec<SubscriberId> },
    MemberAdded(SubscriberId),
    MemberRemoved(SubscriberId),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Join `channel`. Fails with [`CryptexError::RelayAuth`] for an invalid
    /// session.
    async fn subscribe(
        &self,
        session: &SessionToken,
        channel: &str,
    ) -> Result<(SubscriberId, UnboundedReceiver<RelayEvent>)>;

    /// Deliver `event` to every member of `channel` except `sender`.
    async fn publish(&self, channel: &str, sender: SubscriberId, event: RelayEvent) -> Result<()>;

    fn unsubscribe(&self, channel: &str, subscriber: SubscriberId);
}

/// A live relay membership.
pub struct Subscription {
    relay: Arc<dyn SignalingRelay>,
    channel: String,
    id: SubscriberId,
    events: UnboundedReceiver<RelayEvent>,
}

impl Subscription {
    pub async fn open(
        relay: Arc<dyn SignalingRelay>,
        session: &SessionToken,
        channel: &str,
    ) -> Result<Self> {
        let (id, events) = relay.subscribe(session, channel).await?;
        debug!(channel, subscriber = %id, "Subscribed to relay channel");
        Ok(Self {
            relay,
            channel: channel.to_string(),
            id,
            events,
        })
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Result<RelayEvent> {
        self.events
            .recv()
            .await
            .ok_or_else(|| CryptexError::Relay(format!("channel {} closed", self.channel)))
    }

    pub async fn publish(&self, event: RelayEvent) -> Result<()> {
        self.relay.publish(&self.channel, self.id, event).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.relay.unsubscribe(&self.channel, self.id);
        debug!(channel = %self.channel, subscriber = %self.id, "Unsubscribed from relay channel");
    }
}

/// Channel the inviter and joiner meet on, namespaced by the new device.
pub fn pairing_channel(user_id: Uuid) -> String {
    format!("private-pairing-{}", user_id)
}

/// Channel two paired devices sync on, plus this side's role.
///
/// Both sides compute the same name independently: the device registered
/// first (ties broken by id) is the senior and makes the offer.
pub fn sync_channel(local: &RegisteredDevice, remote: &RegisteredDevice) -> (String, Role) {
    let local_is_senior = (local.created_at, local.id) <= (remote.created_at, remote.id);
    let (senior, junior) = if local_is_senior {
        (local, remote)
    } else {
        (remote, local)
    };
    let role = if local_is_senior {
        Role::Offerer
    } else {
        Role::Answerer
    };
    (format!("private-sync-{}-{}", senior.id, junior.id), role)
}
