//! Device pairing: introduce a new device to an account and hand it the vault.
//!
//! The inviter (an already-bound device) generates an Ed25519 identity for
//! the joiner, registers it, and wraps the account-binding material with a
//! one-time mnemonic. Mnemonic and wrapped blob travel out of band. The
//! joiner unwraps them, signs in to the relay with the received key, and
//! both sides negotiate a peer channel over which the inviter sends its
//! vault record once.
//!
//! Each side is an explicit state machine. Stage changes are published on a
//! `watch` channel so a front end can follow along without holding callbacks.

use crate::crypto::{self, mnemonic, EncryptedBlob, EnvelopeSettings};
use crate::storage::VaultStore;
use crate::sync::auth::{authenticate, AuthService};
use crate::sync::channel::{
    recv_message, send_message, unexpected, DataChannel, PeerConnector, PeerMessage,
};
use crate::sync::device::{DeviceIdentity, DeviceRegistry};
use crate::sync::relay::{pairing_channel, SignalingRelay};
use crate::sync::signaling::{negotiate, Cancellation, Role, SignalingContext};
use crate::vault::{b64, b64_secret, LinkedDevice, OnlineServicesAccount, Vault, VaultMetadata};
use crate::{CryptexError, Result};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Account-binding material for the joiner.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferableData {
    pub user_id: Uuid,
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(with = "b64_secret")]
    pub private_key: Zeroizing<Vec<u8>>,
}

impl TransferableData {
    pub fn new(user_id: Uuid, identity: &DeviceIdentity) -> Self {
        let signing_key = identity.signing_key();
        Self {
            user_id,
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: Zeroizing::new(signing_key.to_bytes().to_vec()),
        }
    }

    /// The account record this material binds a vault to.
    pub fn to_account(&self) -> OnlineServicesAccount {
        OnlineServicesAccount {
            user_id: self.user_id,
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            linked_devices: Vec::new(),
        }
    }

    pub fn identity(&self) -> Result<DeviceIdentity> {
        let bytes: Zeroizing<[u8; 32]> = Zeroizing::new(
            self.private_key.as_slice().try_into().map_err(|_| {
                CryptexError::Crypto(crypto::CryptoError::InvalidKeyLength {
                    expected: 32,
                    got: self.private_key.len(),
                })
            })?,
        );
        Ok(DeviceIdentity::from_signing_key(SigningKey::from_bytes(&bytes)))
    }
}

impl fmt::Debug for TransferableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferableData")
            .field("user_id", &self.user_id)
            .field("public_key", &hex::encode(&self.public_key))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Wrap binding material under a mnemonic.
pub async fn wrap_transferable(data: &TransferableData, mnemonic: &str) -> Result<EncryptedBlob> {
    let mut payload = Zeroizing::new(serde_json::to_vec(data)?);
    let blob = crypto::encrypt_async(
        std::mem::take(&mut *payload),
        mnemonic::normalize(mnemonic),
        EnvelopeSettings::mnemonic(),
    )
    .await?;
    Ok(blob)
}

/// Unwrap binding material. A wrong mnemonic surfaces as a decryption
/// failure; input is normalized first so case, spacing and dashes do not
/// matter.
pub async fn unwrap_transferable(blob: &EncryptedBlob, mnemonic: &str) -> Result<TransferableData> {
    let payload = crypto::decrypt_async(blob.clone(), mnemonic::normalize(mnemonic)).await?;
    serde_json::from_slice(&payload).map_err(|_| crypto::CryptoError::Decryption.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviterStage {
    GeneratingKeys,
    RegisteringDevice,
    WrappingTransferableData,
    ShowingMnemonic,
    WaitingForPeer,
    Connected,
    Transmitting,
    Done,
    /// Abandoned; the registered device has been removed.
    Aborted,
}

/// What the inviter hands to the operator: shown once, never sent over
/// the network.
pub struct Invitation {
    pub user_id: Uuid,
    pub mnemonic: Zeroizing<String>,
    /// The wrapped binding material. Safe to move over any channel.
    pub transfer: EncryptedBlob,
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("user_id", &self.user_id)
            .field("mnemonic", &"<redacted>")
            .finish_non_exhaustive()
    }
}

pub struct Inviter {
    account_id: Uuid,
    registry: Arc<dyn DeviceRegistry>,
    stage: watch::Sender<InviterStage>,
    new_device: Option<Uuid>,
    connector: Option<Arc<dyn PeerConnector>>,
    channel: Option<Box<dyn DataChannel>>,
    /// Cancellation and timeout of the connection, kept for later waits.
    ctx: Option<SignalingContext>,
}

impl Inviter {
    /// `account_id` is this device's own user id, sent to the joiner as the
    /// vault's sender.
    pub fn new(account_id: Uuid, registry: Arc<dyn DeviceRegistry>) -> Self {
        let (stage, _) = watch::channel(InviterStage::GeneratingKeys);
        Self {
            account_id,
            registry,
            stage,
            new_device: None,
            connector: None,
            channel: None,
            ctx: None,
        }
    }

    pub fn stage(&self) -> InviterStage {
        *self.stage.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InviterStage> {
        self.stage.subscribe()
    }

    /// Id of the device being introduced, once registered.
    pub fn new_device(&self) -> Option<Uuid> {
        self.new_device
    }

    /// Generate, register and wrap the joiner's identity. A failed
    /// registration leaves the inviter ready to try again.
    pub async fn prepare(&mut self) -> Result<Invitation> {
        self.expect(InviterStage::GeneratingKeys, "inviter generating keys")?;
        let identity = DeviceIdentity::generate();

        self.advance(InviterStage::RegisteringDevice);
        let user_id = match self
            .registry
            .register_device(&identity.public_key_bytes())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Could not register pairing device");
                self.advance(InviterStage::GeneratingKeys);
                return Err(e);
            }
        };
        self.new_device = Some(user_id);
        info!(device = %user_id, "Registered pairing device");

        self.advance(InviterStage::WrappingTransferableData);
        let mnemonic = mnemonic::generate();
        let data = TransferableData::new(user_id, &identity);
        let transfer = match wrap_transferable(&data, &mnemonic).await {
            Ok(blob) => blob,
            Err(e) => return Err(self.fail(e).await),
        };

        self.advance(InviterStage::ShowingMnemonic);
        Ok(Invitation {
            user_id,
            mnemonic,
            transfer,
        })
    }

    /// Wait for the joiner on the pairing channel and connect. The context's
    /// session is this device's own relay session; its cancellation and
    /// timeout also cover [`transmit`](Self::transmit).
    pub async fn connect(
        &mut self,
        ctx: &SignalingContext,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<()> {
        self.expect(InviterStage::ShowingMnemonic, "inviter showing mnemonic")?;
        let user_id = self.registered()?;

        self.advance(InviterStage::WaitingForPeer);
        match negotiate(Role::Offerer, ctx, &pairing_channel(user_id), connector.clone()).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.connector = Some(connector);
                self.ctx = Some(ctx.clone());
                self.advance(InviterStage::Connected);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Send the vault record once and wait for the joiner's acknowledgement.
    pub async fn transmit(&mut self, metadata: &VaultMetadata) -> Result<()> {
        self.expect(InviterStage::Connected, "connected inviter")?;
        if metadata.blob.is_none() {
            return Err(CryptexError::InvalidInput(
                "Cannot send a vault with no encrypted contents".to_string(),
            ));
        }

        self.advance(InviterStage::Transmitting);
        match self.send_vault(metadata).await {
            Ok(()) => {
                self.release().await;
                self.advance(InviterStage::Done);
                info!(vault = %metadata.id, "Sent vault to paired device");
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Record the joiner as a linked device. Persisting `account` is up to
    /// the caller.
    pub fn complete(
        &self,
        account: &mut OnlineServicesAccount,
        name: &str,
    ) -> Result<LinkedDevice> {
        self.expect(InviterStage::Done, "finished pairing")?;
        let user_id = self.registered()?;
        account.link_device(user_id, name, Utc::now());
        account
            .linked_device(user_id)
            .cloned()
            .ok_or_else(|| CryptexError::NotFound(format!("linked device {}", user_id)))
    }

    /// Abandon pairing: close the peer connection and remove the device
    /// registered for the joiner. Does nothing once pairing is done.
    pub async fn abort(&mut self) -> Result<()> {
        if matches!(self.stage(), InviterStage::Done | InviterStage::Aborted) {
            return Ok(());
        }
        self.release().await;
        self.advance(InviterStage::Aborted);
        if let Some(id) = self.new_device.take() {
            self.registry.remove_device(id).await?;
            info!(device = %id, "Removed orphaned pairing device");
        }
        Ok(())
    }

    async fn send_vault(&mut self, metadata: &VaultMetadata) -> Result<()> {
        let ctx = self.ctx.clone().ok_or(CryptexError::InvalidState {
            expected: "connected inviter",
            actual: "no signaling context".to_string(),
        })?;
        let channel = self
            .channel
            .as_deref_mut()
            .ok_or_else(|| CryptexError::Transport("no data channel".to_string()))?;
        let message = PeerMessage::VaultPayload {
            sender: self.account_id,
            metadata: metadata.clone(),
        };
        send_message(channel, &message).await?;
        match ctx.guard(recv_message(channel)).await? {
            PeerMessage::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn fail(&mut self, error: CryptexError) -> CryptexError {
        warn!(stage = ?self.stage(), error = %error, "Pairing failed");
        if let Err(e) = self.abort().await {
            warn!(error = %e, "Could not remove orphaned pairing device");
        }
        error
    }

    async fn release(&mut self) {
        self.ctx = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(connector) = self.connector.take() {
            connector.close().await;
        }
    }

    fn registered(&self) -> Result<Uuid> {
        self.new_device.ok_or(CryptexError::InvalidState {
            expected: "registered pairing device",
            actual: "none".to_string(),
        })
    }

    fn expect(&self, stage: InviterStage, expected: &'static str) -> Result<()> {
        let current = self.stage();
        if current != stage {
            return Err(CryptexError::InvalidState {
                expected,
                actual: format!("{:?}", current),
            });
        }
        Ok(())
    }

    fn advance(&self, stage: InviterStage) {
        self.stage.send_replace(stage);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingMethod {
    QrCode,
    Sound,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinerStage {
    LinkingMethod,
    DecryptionPassphrase,
    WaitingForDevice,
    ReceivingVaultPayload,
    SavingVault,
}

/// Operator input to the joiner.
pub enum JoinerEvent {
    /// How the transfer arrived, and the transfer itself.
    ChooseMethod {
        method: LinkingMethod,
        transfer: EncryptedBlob,
    },
    EnterMnemonic(Zeroizing<String>),
    Back,
}

impl fmt::Debug for JoinerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinerEvent::ChooseMethod { method, .. } => {
                f.debug_struct("ChooseMethod").field("method", method).finish_non_exhaustive()
            }
            JoinerEvent::EnterMnemonic(_) => f.write_str("EnterMnemonic(<redacted>)"),
            JoinerEvent::Back => f.write_str("Back"),
        }
    }
}

pub struct Joiner {
    /// Local name for the inviting device.
    peer_name: String,
    stage: watch::Sender<JoinerStage>,
    transfer: Option<EncryptedBlob>,
    binding: Option<TransferableData>,
    connector: Option<Arc<dyn PeerConnector>>,
    channel: Option<Box<dyn DataChannel>>,
    ctx: Option<SignalingContext>,
    received: Option<(Uuid, VaultMetadata)>,
    saved: bool,
}

impl Joiner {
    pub fn new(peer_name: impl Into<String>) -> Self {
        let (stage, _) = watch::channel(JoinerStage::LinkingMethod);
        Self {
            peer_name: peer_name.into(),
            stage,
            transfer: None,
            binding: None,
            connector: None,
            channel: None,
            ctx: None,
            received: None,
            saved: false,
        }
    }

    pub fn stage(&self) -> JoinerStage {
        *self.stage.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JoinerStage> {
        self.stage.subscribe()
    }

    /// This device's user id, once the mnemonic has been accepted.
    pub fn user_id(&self) -> Option<Uuid> {
        self.binding.as_ref().map(|b| b.user_id)
    }

    /// Feed operator input. Recoverable errors (wrong mnemonic, unsupported
    /// method) leave the stage unchanged.
    pub async fn handle(&mut self, event: JoinerEvent) -> Result<JoinerStage> {
        match (self.stage(), event) {
            (JoinerStage::LinkingMethod, JoinerEvent::ChooseMethod { method, transfer }) => {
                if method != LinkingMethod::File {
                    return Err(CryptexError::Unsupported(format!(
                        "{:?} linking is not available",
                        method
                    )));
                }
                self.transfer = Some(transfer);
                self.advance(JoinerStage::DecryptionPassphrase);
            }
            (JoinerStage::DecryptionPassphrase, JoinerEvent::EnterMnemonic(mnemonic)) => {
                let transfer = self.transfer.as_ref().ok_or(CryptexError::InvalidState {
                    expected: "pairing transfer",
                    actual: "none".to_string(),
                })?;
                match unwrap_transferable(transfer, &mnemonic).await {
                    Ok(binding) => {
                        info!(device = %binding.user_id, "Unwrapped pairing transfer");
                        self.binding = Some(binding);
                        self.advance(JoinerStage::WaitingForDevice);
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not unwrap pairing transfer");
                        return Err(e);
                    }
                }
            }
            (JoinerStage::DecryptionPassphrase, JoinerEvent::Back) => {
                self.transfer = None;
                self.advance(JoinerStage::LinkingMethod);
            }
            (stage, event) => {
                return Err(CryptexError::InvalidState {
                    expected: "event valid for the current stage",
                    actual: format!("{:?} in {:?}", event, stage),
                });
            }
        }
        Ok(self.stage())
    }

    /// Sign in with the received key and connect to the inviter. On failure
    /// the joiner stays in `WaitingForDevice` so the operator can retry.
    /// `cancel` and `timeout` also cover [`receive`](Self::receive).
    pub async fn connect(
        &mut self,
        auth: &dyn AuthService,
        relay: Arc<dyn SignalingRelay>,
        connector: Arc<dyn PeerConnector>,
        cancel: Cancellation,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.expect(JoinerStage::WaitingForDevice, "joiner waiting for device")?;
        let binding = self.binding.as_ref().ok_or(CryptexError::InvalidState {
            expected: "unwrapped pairing transfer",
            actual: "none".to_string(),
        })?;
        let user_id = binding.user_id;
        let identity = binding.identity()?;

        let session = authenticate(auth, user_id, &identity).await?;
        let ctx = SignalingContext::new(relay, session)
            .with_cancellation(cancel)
            .with_timeout(timeout);
        let channel = negotiate(
            Role::Answerer,
            &ctx,
            &pairing_channel(user_id),
            connector.clone(),
        )
        .await?;

        self.channel = Some(channel);
        self.connector = Some(connector);
        self.ctx = Some(ctx);
        self.advance(JoinerStage::ReceivingVaultPayload);
        Ok(())
    }

    /// Receive the inviter's vault record and acknowledge it.
    pub async fn receive(&mut self) -> Result<()> {
        self.expect(JoinerStage::ReceivingVaultPayload, "joiner receiving vault")?;
        let result = self.receive_vault().await;
        self.release().await;

        match result {
            Ok((sender, metadata)) => {
                info!(vault = %metadata.id, "Received vault from paired device");
                self.received = Some((sender, metadata));
                self.advance(JoinerStage::SavingVault);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Vault transfer failed");
                self.advance(JoinerStage::WaitingForDevice);
                Err(e)
            }
        }
    }

    /// Open the received vault with the operator's vault passphrase, bind it
    /// to this device and persist it in one write. A wrong passphrase is
    /// recoverable and leaves nothing written.
    pub async fn save(
        &mut self,
        passphrase: &str,
        store: &dyn VaultStore,
    ) -> Result<VaultMetadata> {
        self.expect(JoinerStage::SavingVault, "joiner saving vault")?;
        if self.saved {
            return Err(CryptexError::InvalidState {
                expected: "unsaved vault",
                actual: "already saved".to_string(),
            });
        }
        let (sender, metadata) = self.received.as_ref().ok_or(CryptexError::InvalidState {
            expected: "received vault",
            actual: "none".to_string(),
        })?;
        let binding = self.binding.as_ref().ok_or(CryptexError::InvalidState {
            expected: "unwrapped pairing transfer",
            actual: "none".to_string(),
        })?;
        let blob = metadata.blob.clone().ok_or_else(|| {
            CryptexError::InvalidInput("Received vault has no encrypted contents".to_string())
        })?;
        let settings = blob.settings();

        let passphrase = Zeroizing::new(passphrase.to_string());
        let payload = crypto::decrypt_async(blob, passphrase.clone()).await?;
        let mut vault = Vault::from_bytes(&payload)?;

        let mut account = binding.to_account();
        account.link_device(*sender, self.peer_name.as_str(), Utc::now());
        vault.online_services_account = Some(account);

        let mut payload = vault.to_bytes()?;
        let blob =
            crypto::encrypt_async(std::mem::take(&mut *payload), passphrase, settings).await?;
        let saved = VaultMetadata {
            blob: Some(blob),
            last_used: Utc::now(),
            ..metadata.clone()
        };
        store.save(&saved)?;
        self.saved = true;
        info!(vault = %saved.id, "Saved paired vault");
        Ok(saved)
    }

    /// Give up: close any peer connection. The inviter reaps the device.
    pub async fn cancel(&mut self) {
        self.release().await;
    }

    async fn receive_vault(&mut self) -> Result<(Uuid, VaultMetadata)> {
        let ctx = self.ctx.clone().ok_or(CryptexError::InvalidState {
            expected: "connected joiner",
            actual: "no signaling context".to_string(),
        })?;
        let channel = self
            .channel
            .as_deref_mut()
            .ok_or_else(|| CryptexError::Transport("no data channel".to_string()))?;
        let (sender, metadata) = match ctx.guard(recv_message(channel)).await? {
            PeerMessage::VaultPayload { sender, metadata } => (sender, metadata),
            other => return Err(unexpected("vault payload", &other)),
        };
        if metadata.blob.is_none() {
            return Err(CryptexError::InvalidInput(
                "Received vault has no encrypted contents".to_string(),
            ));
        }
        send_message(channel, &PeerMessage::Ack).await?;
        Ok((sender, metadata))
    }

    async fn release(&mut self) {
        self.ctx = None;
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(connector) = self.connector.take() {
            connector.close().await;
        }
    }

    fn expect(&self, stage: JoinerStage, expected: &'static str) -> Result<()> {
        let current = self.stage();
        if current != stage {
            return Err(CryptexError::InvalidState {
                expected,
                actual: format!("{:?}", current),
            });
        }
        Ok(())
    }

    fn advance(&self, stage: JoinerStage) {
        self.stage.send_replace(stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryDeviceRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn transfer_for(user_id: Uuid) -> (TransferableData, DeviceIdentity) {
        let identity = DeviceIdentity::generate();
        (TransferableData::new(user_id, &identity), identity)
    }

    #[tokio::test]
    async fn transferable_roundtrip_with_sloppy_input() {
        let (data, identity) = transfer_for(Uuid::new_v4());
        let mnemonic = mnemonic::generate();
        let blob = wrap_transferable(&data, &mnemonic).await.unwrap();
        assert_eq!(blob.settings(), EnvelopeSettings::mnemonic());

        let sloppy = mnemonic.replace('-', " ").to_lowercase();
        let restored = unwrap_transferable(&blob, &sloppy).await.unwrap();
        assert_eq!(restored.user_id, data.user_id);
        assert_eq!(
            restored.identity().unwrap().public_key_bytes(),
            identity.public_key_bytes()
        );
    }

    #[tokio::test]
    async fn wrong_mnemonic_is_decryption_failure() {
        let (data, _) = transfer_for(Uuid::new_v4());
        let blob = wrap_transferable(&data, &mnemonic::generate()).await.unwrap();
        let err = unwrap_transferable(&blob, &mnemonic::generate())
            .await
            .unwrap_err();
        assert!(err.is_decryption_failure());
        assert!(err.is_recoverable());
    }

    #[test]
    fn secrets_stay_out_of_debug() {
        let (data, _) = transfer_for(Uuid::new_v4());
        let rendered = format!("{:?}", data);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&hex::encode(data.private_key.as_slice())));

        let event = JoinerEvent::EnterMnemonic(Zeroizing::new("SECRET-WORDS".to_string()));
        assert!(!format!("{:?}", event).contains("SECRET"));
    }

    #[tokio::test]
    async fn unsupported_methods_keep_stage() {
        let (data, _) = transfer_for(Uuid::new_v4());
        let blob = wrap_transferable(&data, &mnemonic::generate()).await.unwrap();
        let mut joiner = Joiner::new("Desktop");

        for method in [LinkingMethod::QrCode, LinkingMethod::Sound] {
            let err = joiner
                .handle(JoinerEvent::ChooseMethod {
                    method,
                    transfer: blob.clone(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, CryptexError::Unsupported(_)));
            assert_eq!(joiner.stage(), JoinerStage::LinkingMethod);
        }

        let stage = joiner
            .handle(JoinerEvent::ChooseMethod {
                method: LinkingMethod::File,
                transfer: blob,
            })
            .await
            .unwrap();
        assert_eq!(stage, JoinerStage::DecryptionPassphrase);

        assert_eq!(
            joiner.handle(JoinerEvent::Back).await.unwrap(),
            JoinerStage::LinkingMethod
        );
    }

    /// Refuses the first registration, then behaves like the in-memory registry.
    struct FlakyRegistry {
        inner: MemoryDeviceRegistry,
        refuse_next: AtomicBool,
    }

    #[async_trait::async_trait]
    impl DeviceRegistry for FlakyRegistry {
        async fn register_device(&self, public_key: &[u8]) -> Result<Uuid> {
            if self.refuse_next.swap(false, Ordering::SeqCst) {
                return Err(CryptexError::Registry("account service unavailable".to_string()));
            }
            self.inner.register_device(public_key).await
        }

        async fn remove_device(&self, id: Uuid) -> Result<()> {
            self.inner.remove_device(id).await
        }

        async fn list_devices(&self) -> Result<Vec<crate::sync::RegisteredDevice>> {
            self.inner.list_devices().await
        }

        async fn device_public_key(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
            self.inner.device_public_key(id).await
        }
    }

    #[tokio::test]
    async fn prepare_can_retry_after_registration_fails() {
        let registry = Arc::new(FlakyRegistry {
            inner: MemoryDeviceRegistry::new(),
            refuse_next: AtomicBool::new(true),
        });
        let mut inviter = Inviter::new(Uuid::new_v4(), registry.clone());

        let err = inviter.prepare().await.unwrap_err();
        assert!(matches!(err, CryptexError::Registry(_)));
        assert_eq!(inviter.stage(), InviterStage::GeneratingKeys);
        assert_eq!(inviter.new_device(), None);
        assert!(registry.list_devices().await.unwrap().is_empty());

        let invitation = inviter.prepare().await.unwrap();
        assert_eq!(inviter.stage(), InviterStage::ShowingMnemonic);
        assert_eq!(inviter.new_device(), Some(invitation.user_id));
        assert!(registry.inner.device(invitation.user_id).is_some());
    }

    #[tokio::test]
    async fn out_of_order_event_rejected() {
        let mut joiner = Joiner::new("Desktop");
        let err = joiner
            .handle(JoinerEvent::EnterMnemonic(Zeroizing::new("x".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptexError::InvalidState { .. }));
        assert_eq!(joiner.stage(), JoinerStage::LinkingMethod);
    }
}
