//! Offer/answer/ICE negotiation over the relay.
//!
//! [`negotiate`] owns both resources of a handshake: the relay
//! [`Subscription`] and the peer connection. The subscription is dropped as
//! soon as the peer reports connected; on any error, cancellation or timeout
//! the peer connection is closed as well.
//!
//! Waits after the handshake go through [`SignalingContext::guard`] so the
//! same cancellation and timeout keep applying once payloads move.

use crate::sync::auth::SessionToken;
use crate::sync::channel::{
    DataChannel, IceCandidate, PeerConnectionState, PeerConnector, PeerEvent,
};
use crate::sync::relay::{RelayEvent, SignalingRelay, Subscription};
use crate::{CryptexError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which side of the handshake this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waits for the peer to appear on the channel, then sends the offer.
    Offerer,
    Answerer,
}

/// Operator side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by waiting states.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Stays pending forever if the handle was
    /// dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

/// What a negotiation needs besides the peer connection.
#[derive(Clone)]
pub struct SignalingContext {
    pub relay: Arc<dyn SignalingRelay>,
    pub session: SessionToken,
    pub cancel: Cancellation,
    /// Limit on each waiting state. `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl SignalingContext {
    pub fn new(relay: Arc<dyn SignalingRelay>, session: SessionToken) -> Self {
        Self {
            relay,
            session,
            cancel: Cancellation::never(),
            timeout: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Await `wait` unless cancellation or the timeout comes first.
    pub async fn guard<T, F>(&self, wait: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(CryptexError::PairingCancelled);
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CryptexError::PairingCancelled),
            _ = elapsed(deadline) => Err(CryptexError::PairingTimeout),
            result = wait => result,
        }
    }
}

/// Run the handshake on `channel` and return the connected data channel.
pub async fn negotiate(
    role: Role,
    ctx: &SignalingContext,
    channel: &str,
    connector: Arc<dyn PeerConnector>,
) -> Result<Box<dyn DataChannel>> {
    let result = run(role, ctx, channel, connector.as_ref()).await;
    if let Err(e) = &result {
        warn!(channel, ?role, error = %e, "Signaling failed");
        connector.close().await;
    }
    result
}

async fn run(
    role: Role,
    ctx: &SignalingContext,
    channel: &str,
    connector: &dyn PeerConnector,
) -> Result<Box<dyn DataChannel>> {
    if ctx.cancel.is_cancelled() {
        return Err(CryptexError::PairingCancelled);
    }
    let mut peer_events = connector
        .take_events()
        .ok_or_else(|| CryptexError::InvalidState {
            expected: "fresh peer connection",
            actual: "event stream already taken".to_string(),
        })?;

    let mut subscription = Subscription::open(ctx.relay.clone(), &ctx.session, channel).await?;
    let deadline = ctx.timeout.map(|t| Instant::now() + t);
    let mut negotiation = Negotiation::new(role);
    info!(channel, ?role, "Waiting for peer");

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!(channel, "Signaling cancelled");
                return Err(CryptexError::PairingCancelled);
            }
            _ = elapsed(deadline) => {
                return Err(CryptexError::PairingTimeout);
            }
            event = subscription.recv() => {
                negotiation.on_relay_event(event?, &subscription, connector).await?;
            }
            event = peer_events.recv() => match event {
                Some(PeerEvent::LocalCandidate(candidate)) => {
                    subscription.publish(RelayEvent::IceCandidate(candidate)).await?;
                }
                Some(PeerEvent::StateChanged(PeerConnectionState::Connected)) => break,
                Some(PeerEvent::StateChanged(
                    state @ (PeerConnectionState::Failed | PeerConnectionState::Closed),
                )) => {
                    return Err(CryptexError::Transport(format!(
                        "peer connection {:?}",
                        state
                    )));
                }
                Some(PeerEvent::StateChanged(state)) => {
                    debug!(?state, "Peer connection state changed");
                }
                None => {
                    return Err(CryptexError::Transport(
                        "peer connection dropped".to_string(),
                    ));
                }
            },
        }
    }

    // Signaling only: leave the relay before any payload moves.
    drop(subscription);
    info!(channel, ?role, "Peer connected");
    connector.open_channel().await
}

async fn elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Negotiation {
    role: Role,
    offer_sent: bool,
    remote_described: bool,
    /// Candidates that arrived before the remote description.
    early_candidates: Vec<IceCandidate>,
}

impl Negotiation {
    fn new(role: Role) -> Self {
        Self {
            role,
            offer_sent: false,
            remote_described: false,
            early_candidates: Vec::new(),
        }
    }

    async fn on_relay_event(
        &mut self,
        event: RelayEvent,
        subscription: &Subscription,
        connector: &dyn PeerConnector,
    ) -> Result<()> {
        match event {
            RelayEvent::SubscriptionSucceeded { members } if !members.is_empty() => {
                self.offer(subscription, connector).await
            }
            RelayEvent::MemberAdded(_) => self.offer(subscription, connector).await,
            RelayEvent::Offer(offer) if self.role == Role::Answerer && !self.remote_described => {
                let answer = connector.accept_offer(offer).await?;
                self.remote_described = true;
                subscription.publish(RelayEvent::Answer(answer)).await?;
                self.flush_candidates(connector).await
            }
            RelayEvent::Answer(answer)
                if self.role == Role::Offerer && self.offer_sent && !self.remote_described =>
            {
                connector.accept_answer(answer).await?;
                self.remote_described = true;
                self.flush_candidates(connector).await
            }
            RelayEvent::IceCandidate(candidate) => {
                if self.remote_described {
                    connector.add_ice_candidate(candidate).await
                } else {
                    self.early_candidates.push(candidate);
                    Ok(())
                }
            }
            other => {
                debug!(event = ?other, "Ignoring relay event");
                Ok(())
            }
        }
    }

    async fn offer(
        &mut self,
        subscription: &Subscription,
        connector: &dyn PeerConnector,
    ) -> Result<()> {
        if self.role != Role::Offerer || self.offer_sent {
            return Ok(());
        }
        let offer = connector.create_offer().await?;
        subscription.publish(RelayEvent::Offer(offer)).await?;
        self.offer_sent = true;
        debug!("Sent offer");
        Ok(())
    }

    async fn flush_candidates(&mut self, connector: &dyn PeerConnector) -> Result<()> {
        for candidate in std::mem::take(&mut self.early_candidates) {
            connector.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}
