//! One reconciliation round between two paired devices.
//!
//! Both sides derive the same sync channel. The senior (offerer) sends its
//! credential snapshot; the junior reconciles it against its own with the
//! operator's selection, applies what it keeps to a checked-out copy and
//! sends back the diffs the senior needs. The senior applies those, commits
//! and only then acknowledges; the junior commits once it has the
//! acknowledgement.
//!
//! A round that breaks before the acknowledgement leaves the junior's vault
//! as it was. The senior may already have committed its side, in which case
//! the next round offers the junior the same changes again.

use crate::session::VaultSession;
use crate::storage::VaultStore;
use crate::sync::channel::{
    recv_message, send_message, unexpected, DataChannel, PeerConnector, PeerMessage,
};
use crate::sync::device::RegisteredDevice;
use crate::sync::reconcile::{apply_diffs, reconcile, DiffSelector};
use crate::sync::relay::sync_channel;
use crate::sync::signaling::{negotiate, Role, SignalingContext};
use crate::vault::Vault;
use crate::{CryptexError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// What a round changed on this side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Diffs applied to the local vault.
    pub applied: usize,
    /// Diffs sent for the peer to apply.
    pub sent: usize,
}

/// Run one sync round with `remote`. The remote device must already be
/// linked in the session's vault. Every wait on the peer honours the
/// context's cancellation and timeout.
pub async fn synchronize(
    session: &mut VaultSession,
    store: &dyn VaultStore,
    local: &RegisteredDevice,
    remote: &RegisteredDevice,
    ctx: &SignalingContext,
    connector: Arc<dyn PeerConnector>,
    selector: &mut dyn DiffSelector,
) -> Result<SyncReport> {
    let account = session
        .vault()
        .online_services_account
        .as_ref()
        .ok_or(CryptexError::InvalidState {
            expected: "vault bound to an online services account",
            actual: "unbound vault".to_string(),
        })?;
    if !account.is_linked(remote.id) {
        return Err(CryptexError::NotFound(format!("linked device {}", remote.id)));
    }

    let (channel_name, role) = sync_channel(local, remote);
    let mut channel = negotiate(role, ctx, &channel_name, connector.clone()).await?;

    let round = match role {
        Role::Offerer => senior_round(session, store, remote, ctx, channel.as_mut()).await,
        Role::Answerer => {
            junior_round(session, store, remote, ctx, channel.as_mut(), selector).await
        }
    };
    channel.close().await;
    connector.close().await;

    let report = round.map_err(|e| {
        warn!(peer = %remote.id, error = %e, "Sync round failed");
        e
    })?;
    info!(
        peer = %remote.id,
        applied = report.applied,
        sent = report.sent,
        "Sync round complete"
    );
    Ok(report)
}

async fn senior_round(
    session: &mut VaultSession,
    store: &dyn VaultStore,
    remote: &RegisteredDevice,
    ctx: &SignalingContext,
    channel: &mut dyn DataChannel,
) -> Result<SyncReport> {
    let snapshot = session.vault().credentials.clone();
    send_message(channel, &PeerMessage::Credentials(snapshot)).await?;

    let diffs = match ctx.guard(recv_message(channel)).await? {
        PeerMessage::Diffs(diffs) => diffs,
        other => return Err(unexpected("diffs", &other)),
    };

    let mut working = session.checkout();
    apply_diffs(&mut working.credentials, &diffs)?;
    if let Err(e) = commit_round(session, store, working, remote).await {
        warn!(peer = %remote.id, error = %e, "Could not save synced vault, withholding ack");
        return Err(e);
    }
    send_message(channel, &PeerMessage::Ack).await?;

    Ok(SyncReport {
        applied: diffs.len(),
        sent: 0,
    })
}

async fn junior_round(
    session: &mut VaultSession,
    store: &dyn VaultStore,
    remote: &RegisteredDevice,
    ctx: &SignalingContext,
    channel: &mut dyn DataChannel,
    selector: &mut dyn DiffSelector,
) -> Result<SyncReport> {
    let theirs = match ctx.guard(recv_message(channel)).await? {
        PeerMessage::Credentials(credentials) => credentials,
        other => return Err(unexpected("credentials", &other)),
    };

    let mut working = session.checkout();
    let outcome = reconcile(&session.vault().credentials, &theirs, selector)?;
    apply_diffs(&mut working.credentials, &outcome.to_apply)?;

    send_message(channel, &PeerMessage::Diffs(outcome.to_send.clone())).await?;
    match ctx.guard(recv_message(channel)).await? {
        PeerMessage::Ack => {}
        other => return Err(unexpected("ack", &other)),
    }
    commit_round(session, store, working, remote).await?;

    Ok(SyncReport {
        applied: outcome.to_apply.len(),
        sent: outcome.to_send.len(),
    })
}

/// Stamp the sync time and persist the round's working copy.
async fn commit_round(
    session: &mut VaultSession,
    store: &dyn VaultStore,
    mut working: Vault,
    remote: &RegisteredDevice,
) -> Result<()> {
    if let Some(account) = working.online_services_account.as_mut() {
        account.record_sync(remote.id, Utc::now())?;
    }
    session.commit_async(working, store).await
}
