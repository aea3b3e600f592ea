//! Per-request ROAST signature-coordination state.
//!
//! A request carries one sub-state per wanted signature. Each in-progress
//! signature pipelines nonce commitments one round ahead: replies that carry
//! a share for the participant's open round also carry the commitment that
//! seeds the next round. Misbehaving participants are marked malicious and
//! stay excluded; rejectors may return. The request aborts as soon as the
//! remaining pool cannot meet the highest threshold still in play.

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::{Expiry, HasExpiry};
use crate::coordination::types::{
    ParticipantId, RequestId, SignatureRoundStart, SignaturesRequestDetails, SigningCommitmentSet,
};
use crate::crypto::{AggregateKeyInfo, SchnorrSignature, SignatureShare, Signed, SigningCommitment};

/// One live signing round: the commitment set that opened it and the shares
/// collected so far.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub commitments: SigningCommitmentSet,
    pub shares: Vec<(ParticipantId, SignatureShare)>,
}

impl RoundState {
    pub fn has_share_from(&self, participant: ParticipantId) -> bool {
        self.shares.iter().any(|(id, _)| *id == participant)
    }
}

/// An in-progress single signature within a request.
#[derive(Debug, Clone)]
pub struct InProgressSignature {
    /// The HD master key info this signature verifies against.
    pub key: AggregateKeyInfo,
    /// Pipelined commitments for the round after the current ones.
    pub next_commitments: BTreeMap<ParticipantId, SigningCommitment>,
    /// All rounds opened so far; completed requests never reach here.
    pub rounds: Vec<RoundState>,
    /// The round each participant currently owes a share to.
    pub round_for: BTreeMap<ParticipantId, usize>,
}

impl InProgressSignature {
    pub fn new(key: AggregateKeyInfo) -> Self {
        Self {
            key,
            next_commitments: BTreeMap::new(),
            rounds: Vec::new(),
            round_for: BTreeMap::new(),
        }
    }

    /// Open a new round from the pipelined commitments, pointing every member
    /// at it. Returns the commitment snapshot that opened the round.
    pub fn open_round(&mut self) -> SigningCommitmentSet {
        let snapshot = SigningCommitmentSet {
            commitments: std::mem::take(&mut self.next_commitments),
        };
        self.rounds.push(RoundState {
            commitments: snapshot.clone(),
            shares: Vec::new(),
        });
        let index = self.rounds.len() - 1;
        for participant in snapshot.participants() {
            self.round_for.insert(participant, index);
        }
        snapshot
    }
}

/// State of one wanted signature: collecting rounds, or done.
#[derive(Debug, Clone)]
pub enum SingleSignatureState {
    InProgress(InProgressSignature),
    Finished { signature: SchnorrSignature },
}

/// The full coordination state of one signatures request.
#[derive(Debug, Clone)]
pub struct SignaturesCoordinationState {
    pub request_id: RequestId,
    pub signed_details: Signed<SignaturesRequestDetails>,
    pub creator: ParticipantId,
    pub keys: Vec<AggregateKeyInfo>,
    pub sigs: Vec<SingleSignatureState>,
    /// Participants excluded for provable misbehaviour; membership is
    /// permanent for the lifetime of the request.
    pub malicious: BTreeSet<ParticipantId>,
    /// Participants that declined; they may return by replying again.
    pub rejectors: BTreeSet<ParticipantId>,
}

impl SignaturesCoordinationState {
    /// Mark a participant malicious. Absorbs any standing rejection so the
    /// participant is counted unavailable exactly once.
    pub fn mark_malicious(&mut self, participant: ParticipantId) {
        self.malicious.insert(participant);
        self.rejectors.remove(&participant);
    }

    /// Participants unavailable to signing, counted once each.
    pub fn unavailable(&self) -> usize {
        let revoked = self
            .rejectors
            .iter()
            .filter(|id| !self.malicious.contains(id))
            .count();
        self.malicious.len() + revoked
    }

    /// Highest threshold among signatures still in progress.
    pub fn max_threshold(&self) -> Option<u16> {
        self.sigs
            .iter()
            .filter_map(|sig| match sig {
                SingleSignatureState::InProgress(state) => Some(state.key.threshold),
                SingleSignatureState::Finished { .. } => None,
            })
            .max()
    }

    /// Whether the remaining pool can no longer meet the highest threshold
    /// still in play.
    pub fn availability_failed(&self, group_size: u16) -> bool {
        let Some(max_threshold) = self.max_threshold() else {
            return false;
        };
        let available = (group_size as usize).saturating_sub(self.unavailable());
        available < max_threshold as usize
    }

    /// The finished batch in request order, if every signature is done.
    pub fn all_finished(&self) -> Option<Vec<SchnorrSignature>> {
        self.sigs
            .iter()
            .map(|sig| match sig {
                SingleSignatureState::Finished { signature } => Some(signature.clone()),
                SingleSignatureState::InProgress(_) => None,
            })
            .collect()
    }

    /// The rounds in which `participant` still owes a share, for the login
    /// snapshot.
    pub fn pending_rounds_for(&self, participant: ParticipantId) -> Vec<SignatureRoundStart> {
        let mut pending = Vec::new();
        for (sig_index, sig) in self.sigs.iter().enumerate() {
            let SingleSignatureState::InProgress(state) = sig else {
                continue;
            };
            let Some(&round_index) = state.round_for.get(&participant) else {
                continue;
            };
            let round = &state.rounds[round_index];
            if !round.has_share_from(participant) {
                pending.push(SignatureRoundStart {
                    sig_index,
                    commitments: round.commitments.clone(),
                });
            }
        }
        pending
    }
}

impl HasExpiry for SignaturesCoordinationState {
    fn expiry(&self) -> Expiry {
        self.signed_details.obj.expiry
    }
}

/// A finished batch retained for late pickup.
#[derive(Debug, Clone)]
pub struct CompletedSignatures {
    pub signed_details: Signed<SignaturesRequestDetails>,
    pub signatures: Vec<SchnorrSignature>,
    pub creator: ParticipantId,
    /// Participants that confirmed receipt; skipped at login snapshot time.
    pub acks: BTreeSet<ParticipantId>,
    pub expiry: Expiry,
}

impl HasExpiry for CompletedSignatures {
    fn expiry(&self) -> Expiry {
        self.expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::types::{SignDetails, SingleSignatureDetails};
    use crate::crypto::IdentityKeypair;
    use frost_secp256k1_tr as frost;
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn key_info(threshold: u16) -> AggregateKeyInfo {
        let (_, package) = frost::keys::generate_with_dealer(
            10,
            threshold,
            frost::keys::IdentifierList::Default,
            &mut OsRng,
        )
        .expect("dealer");
        AggregateKeyInfo::from_public_key_package(&package, threshold, [0u8; 32]).expect("info")
    }

    fn coordination(keys: Vec<AggregateKeyInfo>) -> SignaturesCoordinationState {
        let keypair = IdentityKeypair::generate(&mut OsRng);
        let details = SignaturesRequestDetails {
            required_sigs: keys
                .iter()
                .map(|key| SingleSignatureDetails {
                    sign_details: SignDetails {
                        message: b"message".to_vec(),
                        sighash_type: 0,
                    },
                    group_key: key.group_key.clone(),
                    hd_derivation: Vec::new(),
                })
                .collect(),
            expiry: Expiry::from_ttl(Duration::from_secs(3600)),
        };
        let request_id = details.fingerprint().expect("fingerprint");
        let signed_details = Signed::sign(details, &keypair).expect("sign");
        SignaturesCoordinationState {
            request_id,
            signed_details,
            creator: ParticipantId::new_unwrap(1),
            sigs: keys
                .iter()
                .map(|key| SingleSignatureState::InProgress(InProgressSignature::new(key.clone())))
                .collect(),
            keys,
            malicious: BTreeSet::new(),
            rejectors: BTreeSet::new(),
        }
    }

    fn commitment() -> SigningCommitment {
        let (shares, _) = frost::keys::generate_with_dealer(
            2,
            2,
            frost::keys::IdentifierList::Default,
            &mut OsRng,
        )
        .expect("dealer");
        let share = shares.values().next().expect("share").clone();
        let key_package = frost::keys::KeyPackage::try_from(share).expect("pkg");
        frost::round1::commit(key_package.signing_share(), &mut OsRng).1
    }

    #[test]
    fn test_malicious_absorbs_rejection() {
        let mut coordination = coordination(vec![key_info(3)]);
        let p = ParticipantId::new_unwrap(4);
        coordination.rejectors.insert(p);
        assert_eq!(coordination.unavailable(), 1);

        coordination.mark_malicious(p);
        assert_eq!(coordination.unavailable(), 1);
        assert!(coordination.malicious.contains(&p));
        assert!(!coordination.rejectors.contains(&p));
    }

    #[test]
    fn test_availability_failure_at_max_threshold() {
        let mut coordination = coordination(vec![key_info(3)]);
        for id in 2..=8u16 {
            coordination.mark_malicious(ParticipantId::new_unwrap(id));
        }
        // 10 - 7 = 3 signers left, threshold 3: still viable.
        assert!(!coordination.availability_failed(10));

        coordination.mark_malicious(ParticipantId::new_unwrap(9));
        // 10 - 8 = 2 < 3: aborted.
        assert!(coordination.availability_failed(10));
    }

    #[test]
    fn test_finished_signatures_do_not_hold_the_threshold_up() {
        let mut coordination = coordination(vec![key_info(2), key_info(5)]);
        assert_eq!(coordination.max_threshold(), Some(5));

        let signature = {
            // Borrow a real signature shape by signing with a dealer key set.
            let (shares, package) = frost::keys::generate_with_dealer(
                2,
                2,
                frost::keys::IdentifierList::Default,
                &mut OsRng,
            )
            .expect("dealer");
            let mut nonces = BTreeMap::new();
            let mut commitments = BTreeMap::new();
            for (id, share) in &shares {
                let key_package = frost::keys::KeyPackage::try_from(share.clone()).expect("pkg");
                let (nonce, commitment) =
                    frost::round1::commit(key_package.signing_share(), &mut OsRng);
                nonces.insert(*id, (nonce, key_package));
                commitments.insert(*id, commitment);
            }
            let signing_package = frost::SigningPackage::new(commitments, b"message");
            let mut sig_shares = BTreeMap::new();
            for (id, (nonce, key_package)) in &nonces {
                sig_shares.insert(
                    *id,
                    frost::round2::sign(&signing_package, nonce, key_package).expect("sign"),
                );
            }
            frost::aggregate(&signing_package, &sig_shares, &package).expect("aggregate")
        };

        coordination.sigs[1] = SingleSignatureState::Finished { signature };
        assert_eq!(coordination.max_threshold(), Some(2));
        assert!(coordination.all_finished().is_none());
    }

    #[test]
    fn test_open_round_points_members_and_clears_pipeline() {
        let key = key_info(2);
        let mut state = InProgressSignature::new(key);
        state
            .next_commitments
            .insert(ParticipantId::new_unwrap(1), commitment());
        state
            .next_commitments
            .insert(ParticipantId::new_unwrap(6), commitment());

        let snapshot = state.open_round();
        assert_eq!(snapshot.len(), 2);
        assert!(state.next_commitments.is_empty());
        assert_eq!(state.rounds.len(), 1);
        assert_eq!(state.round_for[&ParticipantId::new_unwrap(1)], 0);
        assert_eq!(state.round_for[&ParticipantId::new_unwrap(6)], 0);
    }
}
