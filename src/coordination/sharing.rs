//! Recovery-share routing tables.
//!
//! Per group key, the server tracks which encrypted recovery shares each
//! receiver is still owed and from whom, de-duplicated against shares the
//! sender already posted or the receiver already confirmed.

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::{Expiry, HasExpiry};
use crate::coordination::types::ParticipantId;
use crate::crypto::EncryptedKeyShare;

/// One receiver's standing with respect to recovery shares for a group key.
#[derive(Debug, Clone)]
pub enum ReceiverShareState {
    /// Still collecting shares.
    Pending {
        /// Shares posted for this receiver, by sender, not yet confirmed.
        pending_for_sender: BTreeMap<ParticipantId, EncryptedKeyShare>,
        /// Senders whose shares the receiver has confirmed receiving.
        acknowledged_for_sender: BTreeSet<ParticipantId>,
    },
    /// The receiver holds everything it needs; nothing further is routed.
    Done,
}

impl ReceiverShareState {
    fn pending() -> Self {
        Self::Pending {
            pending_for_sender: BTreeMap::new(),
            acknowledged_for_sender: BTreeSet::new(),
        }
    }
}

/// Recovery-share routing table for one group key.
#[derive(Debug, Clone)]
pub struct KeySharingState {
    pub receiver_shares: BTreeMap<ParticipantId, ReceiverShareState>,
    pub expiry: Expiry,
}

impl KeySharingState {
    pub fn new(expiry: Expiry) -> Self {
        Self {
            receiver_shares: BTreeMap::new(),
            expiry,
        }
    }

    /// Offer a share from `sender` to `receiver`.
    ///
    /// Stored and kept only when the receiver is still pending and has seen
    /// nothing from this sender; otherwise dropped silently. Returns whether
    /// the share was kept.
    pub fn offer(
        &mut self,
        receiver: ParticipantId,
        sender: ParticipantId,
        share: EncryptedKeyShare,
    ) -> bool {
        let state = self
            .receiver_shares
            .entry(receiver)
            .or_insert_with(ReceiverShareState::pending);
        match state {
            ReceiverShareState::Pending {
                pending_for_sender,
                acknowledged_for_sender,
            } => {
                if pending_for_sender.contains_key(&sender)
                    || acknowledged_for_sender.contains(&sender)
                {
                    return false;
                }
                pending_for_sender.insert(sender, share);
                true
            }
            ReceiverShareState::Done => false,
        }
    }

    /// Shares still owed to `receiver`, by sender.
    pub fn pending_for(
        &self,
        receiver: ParticipantId,
    ) -> Option<&BTreeMap<ParticipantId, EncryptedKeyShare>> {
        match self.receiver_shares.get(&receiver)? {
            ReceiverShareState::Pending {
                pending_for_sender, ..
            } => Some(pending_for_sender),
            ReceiverShareState::Done => None,
        }
    }
}

impl HasExpiry for KeySharingState {
    fn expiry(&self) -> Expiry {
        self.expiry
    }
}
