//! Device pairing and peer-to-peer vault reconciliation.
//!
//! - Credential diffs and operator-directed reconciliation
//! - Ed25519 device identity and nonce-based challenge-response sign-in
//! - Relay-brokered signaling for a direct peer channel
//! - Inviter/joiner pairing state machines and the ongoing sync round
//!
//! The relay only ever carries signaling. Vault payloads and diffs travel
//! over the peer data channel.

pub mod auth;
pub mod channel;
pub mod device;
pub mod diff;
pub mod engine;
pub mod memory;
pub mod pairing;
pub mod reconcile;
pub mod relay;
pub mod signaling;


pub use auth::{authenticate, AuthService, ChallengeVerifier, SessionToken};
pub use channel::{DataChannel, PeerConnector, PeerMessage};
pub use device::{reap_orphaned_devices, DeviceIdentity, DeviceRegistry, RegisteredDevice};
pub use diff::{Change, Diff, DiffKey, DiffKind};
pub use engine::{synchronize, SyncReport};
pub use pairing::{
    Invitation, Inviter, InviterStage, Joiner, JoinerEvent, JoinerStage, LinkingMethod,
};
pub use reconcile::{
    apply_diffs, compute_diffs, reconcile, split_selection, AcceptAll, DiffSelector,
    Reconciliation, RejectAll,
};
pub use relay::{pairing_channel, sync_channel, RelayEvent, SignalingRelay, Subscription};
pub use signaling::{cancellation, CancelHandle, Cancellation, Role, SignalingContext};
