//! In-process implementations of the sync seams.
//!
//! A loopback relay, a device registry and a peer network that links
//! connectors through channels. Used by tests and local demos; nothing here
//! touches the network.

use crate::sync::auth::{ChallengeVerifier, SessionToken};
use crate::sync::channel::{
    DataChannel, IceCandidate, PeerConnectionState, PeerConnector, PeerEvent, SessionDescription,
};
use crate::sync::device::{DeviceRegistry, RegisteredDevice};
use crate::sync::relay::{RelayEvent, SignalingRelay, SubscriberId};
use crate::{CryptexError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StoredDevice {
    device: RegisteredDevice,
    public_key: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryDeviceRegistry {
    devices: Mutex<Vec<StoredDevice>>,
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the account's first device.
    pub fn register_root(&self, public_key: &[u8]) -> Uuid {
        self.insert(public_key, true)
    }

    pub fn device(&self, id: Uuid) -> Option<RegisteredDevice> {
        lock(&self.devices)
            .iter()
            .find(|d| d.device.id == id)
            .map(|d| d.device.clone())
    }

    fn insert(&self, public_key: &[u8], root: bool) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.devices).push(StoredDevice {
            device: RegisteredDevice {
                id,
                created_at: Utc::now(),
                root,
            },
            public_key: public_key.to_vec(),
        });
        id
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn register_device(&self, public_key: &[u8]) -> Result<Uuid> {
        if public_key.len() != 32 {
            return Err(CryptexError::Registry(format!(
                "expected a 32-byte public key, got {}",
                public_key.len()
            )));
        }
        Ok(self.insert(public_key, false))
    }

    async fn remove_device(&self, id: Uuid) -> Result<()> {
        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|d| d.device.id != id);
        if devices.len() == before {
            return Err(CryptexError::NotFound(format!("device {}", id)));
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<RegisteredDevice>> {
        Ok(lock(&self.devices).iter().map(|d| d.device.clone()).collect())
    }

    async fn device_public_key(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.devices)
            .iter()
            .find(|d| d.device.id == id)
            .map(|d| d.public_key.clone()))
    }
}

/// Loopback relay. Subscriptions are checked against a [`ChallengeVerifier`].
pub struct MemoryRelay {
    verifier: Arc<ChallengeVerifier>,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(SubscriberId, UnboundedSender<RelayEvent>)>>>,
}

impl MemoryRelay {
    pub fn new(verifier: Arc<ChallengeVerifier>) -> Self {
        Self {
            verifier,
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels).get(channel).map_or(0, Vec::len)
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn subscribe(
        &self,
        session: &SessionToken,
        channel: &str,
    ) -> Result<(SubscriberId, UnboundedReceiver<RelayEvent>)> {
        self.verifier.validate_session(session)?;

        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = lock(&self.channels);
        let members = channels.entry(channel.to_string()).or_default();
        for (_, member) in members.iter() {
            let _ = member.send(RelayEvent::MemberAdded(id));
        }
        let present = members.iter().map(|(member, _)| *member).collect();
        let _ = tx.send(RelayEvent::SubscriptionSucceeded { members: present });
        members.push((id, tx));

        Ok((id, rx))
    }

    async fn publish(&self, channel: &str, sender: SubscriberId, event: RelayEvent) -> Result<()> {
        let channels = lock(&self.channels);
        let members = channels
            .get(channel)
            .filter(|members| members.iter().any(|(id, _)| *id == sender))
            .ok_or_else(|| {
                CryptexError::Relay(format!("{} is not subscribed to {}", sender, channel))
            })?;

        for (id, member) in members {
            if *id != sender {
                let _ = member.send(event.clone());
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) {
        let mut channels = lock(&self.channels);
        let Some(members) = channels.get_mut(channel) else {
            return;
        };
        members.retain(|(id, _)| *id != subscriber);
        for (_, member) in members.iter() {
            let _ = member.send(RelayEvent::MemberRemoved(subscriber));
        }
        if members.is_empty() {
            channels.remove(channel);
        }
    }
}

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";
const CANDIDATE_PREFIX: &str = "memory-candidate:";

/// Links connectors created from the same network.
#[derive(Clone, Default)]
pub struct MemoryPeerNetwork {
    pending: Arc<Mutex<HashMap<String, MemoryDataChannel>>>,
    next_link: Arc<AtomicU64>,
}

impl MemoryPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<MemoryPeerConnector> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(MemoryPeerConnector {
            network: self.clone(),
            state: Mutex::new(LinkState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct LinkState {
    token: Option<String>,
    remote_described: bool,
    remote_candidate: bool,
    connected: bool,
    channel: Option<MemoryDataChannel>,
}

/// A peer connection that becomes connected once the descriptions have
/// been exchanged and one remote candidate has arrived.
pub struct MemoryPeerConnector {
    network: MemoryPeerNetwork,
    state: Mutex<LinkState>,
    events_tx: UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<PeerEvent>>>,
    closed: AtomicBool,
}

impl MemoryPeerConnector {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CryptexError::Transport("peer connection closed".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn announce(&self, token: &str) {
        self.emit(PeerEvent::StateChanged(PeerConnectionState::Connecting));
        self.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("{}{}", CANDIDATE_PREFIX, token),
        }));
    }

    fn maybe_connect(&self, state: &mut LinkState) {
        if state.remote_described && state.remote_candidate && !state.connected {
            state.connected = true;
            self.emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnector for MemoryPeerConnector {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let token = format!(
            "link-{}",
            self.network.next_link.fetch_add(1, Ordering::Relaxed)
        );
        let (ours, theirs) = MemoryDataChannel::pair();
        lock(&self.network.pending).insert(token.clone(), theirs);
        {
            let mut state = lock(&self.state);
            state.token = Some(token.clone());
            state.channel = Some(ours);
        }
        self.announce(&token);
        Ok(SessionDescription {
            sdp: format!("{}{}", OFFER_PREFIX, token),
        })
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.ensure_open()?;
        let token = offer
            .sdp
            .strip_prefix(OFFER_PREFIX)
            .ok_or_else(|| CryptexError::Transport("not an offer".to_string()))?
            .to_string();
        let channel = lock(&self.network.pending)
            .remove(&token)
            .ok_or_else(|| CryptexError::Transport(format!("no pending link {}", token)))?;
        {
            let mut state = lock(&self.state);
            state.token = Some(token.clone());
            state.channel = Some(channel);
            state.remote_described = true;
            self.maybe_connect(&mut state);
        }
        self.announce(&token);
        Ok(SessionDescription {
            sdp: format!("{}{}", ANSWER_PREFIX, token),
        })
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let expected = state
            .token
            .as_deref()
            .map(|token| format!("{}{}", ANSWER_PREFIX, token));
        if expected.as_deref() != Some(answer.sdp.as_str()) {
            return Err(CryptexError::Transport("answer does not match offer".to_string()));
        }
        state.remote_described = true;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.remote_described {
            return Err(CryptexError::Transport(
                "candidate before remote description".to_string(),
            ));
        }
        if !candidate.candidate.starts_with(CANDIDATE_PREFIX) {
            return Err(CryptexError::Transport("malformed candidate".to_string()));
        }
        state.remote_candidate = true;
        self.maybe_connect(&mut state);
        Ok(())
    }

    fn take_events(&self) -> Option<UnboundedReceiver<PeerEvent>> {
        lock(&self.events_rx).take()
    }

    async fn open_channel(&self) -> Result<Box<dyn DataChannel>> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(CryptexError::InvalidState {
                expected: "connected peer",
                actual: "still negotiating".to_string(),
            });
        }
        let channel = state
            .channel
            .take()
            .ok_or_else(|| CryptexError::Transport("data channel already opened".to_string()))?;
        Ok(Box::new(channel))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = {
            let mut state = lock(&self.state);
            state.channel = None;
            state.token.take()
        };
        if let Some(token) = token {
            lock(&self.network.pending).remove(&token);
        }
        self.emit(PeerEvent::StateChanged(PeerConnectionState::Closed));
        debug!("Closed peer connection");
    }
}

/// One end of an in-memory byte channel.
pub struct MemoryDataChannel {
    tx: Option<UnboundedSender<Vec<u8>>>,
    rx: UnboundedReceiver<Vec<u8>>,
}

impl MemoryDataChannel {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| CryptexError::Transport("data channel closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| CryptexError::Transport("peer closed the data channel".to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| CryptexError::Transport("peer closed the data channel".to_string()))
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
