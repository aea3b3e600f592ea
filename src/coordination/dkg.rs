//! Per-named-DKG two-round state and the acknowledgement cache.
//!
//! Round 1 collects public commitments in arrival order; round 2 collects
//! per-recipient encrypted secrets plus a signature binding the commitment
//! set. The server never retains key material: finishing round 2 deletes the
//! DKG.

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::{Expiry, HasExpiry};
use crate::coordination::types::{DkgAck, NewDkgDetails, ParticipantId};
use crate::crypto::{self, CryptoError, DkgCommitment, Signed};

/// Round progress of one named DKG.
#[derive(Debug, Clone)]
pub enum DkgRoundState {
    /// Collecting public commitments; each participant appears at most once.
    Round1 {
        commitments: Vec<(ParticipantId, DkgCommitment)>,
    },
    /// All commitments are in; collecting per-recipient encrypted secrets.
    Round2 {
        expected_hash: [u8; 32],
        participants_provided: BTreeSet<ParticipantId>,
    },
}

/// One named DKG tracked by the server.
#[derive(Debug, Clone)]
pub struct DkgState {
    pub signed_details: Signed<NewDkgDetails>,
    pub creator: ParticipantId,
    pub round: DkgRoundState,
}

impl DkgState {
    /// Open a new DKG in round 1, seeded with the creator's commitment.
    pub fn new(
        signed_details: Signed<NewDkgDetails>,
        creator: ParticipantId,
        commitment: DkgCommitment,
    ) -> Self {
        Self {
            signed_details,
            creator,
            round: DkgRoundState::Round1 {
                commitments: vec![(creator, commitment)],
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.signed_details.obj.name
    }

    /// Whether the given participant has a round-1 commitment recorded.
    pub fn has_commitment(&self, participant: ParticipantId) -> bool {
        match &self.round {
            DkgRoundState::Round1 { commitments } => {
                commitments.iter().any(|(id, _)| *id == participant)
            }
            DkgRoundState::Round2 { .. } => true,
        }
    }

    /// Record a round-1 commitment; when the set reaches `group_size` the
    /// DKG advances to round 2 with the binding hash of the full set.
    ///
    /// The caller has already checked the round and for duplicates.
    pub fn push_commitment(
        &mut self,
        participant: ParticipantId,
        commitment: DkgCommitment,
        group_size: u16,
    ) -> Result<(), CryptoError> {
        let DkgRoundState::Round1 { commitments } = &mut self.round else {
            return Ok(());
        };
        commitments.push((participant, commitment));
        if commitments.len() == group_size as usize {
            let expected_hash = crypto::hash_with_commitments(
                &self.signed_details.obj,
                commitments.iter().map(|(id, c)| (id.get(), c)),
            )?;
            self.round = DkgRoundState::Round2 {
                expected_hash,
                participants_provided: BTreeSet::new(),
            };
        }
        Ok(())
    }

    /// Losing a participant invalidates the commitment set: round 2 falls
    /// back to an empty round 1, and a round-1 commitment from the departing
    /// participant is dropped.
    pub fn demote_for_logout(&mut self, departing: ParticipantId) {
        match &mut self.round {
            DkgRoundState::Round2 { .. } => {
                self.round = DkgRoundState::Round1 {
                    commitments: Vec::new(),
                };
            }
            DkgRoundState::Round1 { commitments } => {
                commitments.retain(|(id, _)| *id != departing);
            }
        }
    }
}

impl HasExpiry for DkgState {
    fn expiry(&self) -> Expiry {
        self.signed_details.obj.expiry
    }
}

/// Group-key-indexed cache of signed accept/reject acknowledgements.
#[derive(Debug, Clone)]
pub struct DkgAckCache {
    pub acks: BTreeMap<ParticipantId, Signed<DkgAck>>,
    pub expiry: Expiry,
}

impl DkgAckCache {
    pub fn new(expiry: Expiry) -> Self {
        Self {
            acks: BTreeMap::new(),
            expiry,
        }
    }

    /// Install an acknowledgement unless an equal-or-better one is cached.
    ///
    /// A `false` acknowledgement never replaces anything; a `true` one
    /// upgrades a cached `false`. Returns whether the cache changed.
    pub fn upsert(&mut self, signer: ParticipantId, signed: Signed<DkgAck>) -> bool {
        match self.acks.get(&signer) {
            None => {
                self.acks.insert(signer, signed);
                true
            }
            Some(existing) if existing.obj.accepted || !signed.obj.accepted => false,
            Some(_) => {
                self.acks.insert(signer, signed);
                true
            }
        }
    }
}

impl HasExpiry for DkgAckCache {
    fn expiry(&self) -> Expiry {
        self.expiry
    }
}
