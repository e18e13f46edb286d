//! Peer connection and data channel seams.
//!
//! A [`PeerConnector`] is one peer connection for one negotiation. Signaling
//! (offer, answer, ICE candidates) is fed in from the relay; once connected
//! it yields a [`DataChannel`] that carries JSON [`PeerMessage`]s.

use crate::credential::Credential;
use crate::sync::diff::Diff;
use crate::vault::VaultMetadata;
use crate::{CryptexError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events a peer connection raises while negotiating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Gathered locally; forward to the remote side over the relay.
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Fails until a remote description has been applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// The event stream. Only the first call returns it.
    fn take_events(&self) -> Option<UnboundedReceiver<PeerEvent>>;

    /// The data channel of a connected peer.
    async fn open_channel(&self) -> Result<Box<dyn DataChannel>>;

    /// Tear down the connection. Safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Next frame. Fails with [`CryptexError::Transport`] once the peer
    /// has closed.
    async fn recv(&mut self) -> Result<Vec<u8>>;

    async fn close(&mut self);
}

/// Everything that crosses the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum PeerMessage {
    /// Initial pairing: the inviter's whole vault record.
    VaultPayload {
        sender: Uuid,
        metadata: VaultMetadata,
    },
    /// Ongoing sync: the senior's credential snapshot.
    Credentials(Vec<Credential>),
    /// Ongoing sync: the junior's diffs for the senior to apply.
    Diffs(Vec<Diff>),
    Ack,
}

impl PeerMessage {
    fn label(&self) -> &'static str {
        match self {
            PeerMessage::VaultPayload { .. } => "vault payload",
            PeerMessage::Credentials(_) => "credentials",
            PeerMessage::Diffs(_) => "diffs",
            PeerMessage::Ack => "ack",
        }
    }
}

pub async fn send_message(channel: &mut dyn DataChannel, message: &PeerMessage) -> Result<()> {
    let frame = serde_json::to_vec(message)?;
    channel.send(frame).await
}

pub async fn recv_message(channel: &mut dyn DataChannel) -> Result<PeerMessage> {
    let frame = channel.recv().await?;
    serde_json::from_slice(&frame)
        .map_err(|e| CryptexError::Transport(format!("Malformed peer message: {}", e)))
}

/// Error for a peer message of the wrong kind.
pub(crate) fn unexpected(expected: &'static str, got: &PeerMessage) -> CryptexError {
    CryptexError::InvalidState {
        expected,
        actual: format!("peer sent {}", got.label()),
    }
}
