//! Protocol data model: identifiers, signed detail objects, and the
//! request/response value types of the coordination API.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::Expiry;
use crate::coordination::events::ServerEvent;
use crate::crypto::{
    self, CryptoError, DkgCommitment, EncryptedKeyShare, FrostIdentifier, GroupKey,
    SchnorrSignature, Signed, SigningCommitment,
};

/// Fresh random 16-byte nonce identifying a pending login.
pub type ChallengeId = Uuid;

/// Fresh random 16-byte token identifying a live session.
pub type SessionId = Uuid;

// =============================================================================
// ParticipantId
// =============================================================================

/// Participant identifier (1-based index in FROST).
///
/// FROST requires participant IDs to be non-zero. This newtype enforces that
/// constraint at the type level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct ParticipantId(u16);

impl ParticipantId {
    /// Create a new participant ID.
    ///
    /// Returns `None` if the ID is 0 (invalid in FROST).
    #[must_use]
    pub const fn new(id: u16) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Create a participant ID, panicking if invalid.
    ///
    /// # Panics
    /// Panics if `id` is 0.
    #[must_use]
    pub const fn new_unwrap(id: u16) -> Self {
        match Self::new(id) {
            Some(p) => p,
            None => panic!("ParticipantId cannot be 0"),
        }
    }

    /// Get the raw u16 value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The FROST identifier for this participant.
    ///
    /// # Panics
    /// Never panics: the constructor guarantees a non-zero index, for which
    /// the conversion is total.
    #[must_use]
    pub fn frost(self) -> FrostIdentifier {
        FrostIdentifier::try_from(self.0).expect("non-zero identifier")
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ParticipantId> for u16 {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl TryFrom<u16> for ParticipantId {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or("participant ID cannot be 0")
    }
}

// =============================================================================
// Request ids and fingerprints
// =============================================================================

/// 16-byte fingerprint identifying a signatures request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 16]);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// =============================================================================
// Login
// =============================================================================

/// A fresh login challenge to be signed by the participant's long-term key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub nonce: ChallengeId,
}

/// Challenge handed back from `login`, valid until `expiry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginChallenge {
    pub challenge: AuthChallenge,
    pub expiry: Expiry,
}

// =============================================================================
// DKG detail objects
// =============================================================================

/// Creator-signed description of a new DKG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDkgDetails {
    pub name: String,
    pub description: String,
    pub threshold: u16,
    pub expiry: Expiry,
}

/// Signed attestation that a participant does (or does not) hold a valid
/// share for a group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgAck {
    pub group_key: GroupKey,
    pub accepted: bool,
}

/// A [`DkgAck`] together with the participant that signed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDkgAck {
    pub signer: ParticipantId,
    pub signed: Signed<DkgAck>,
}

/// One entry of a `request_dkg_acks` call: which participants' ACKs are
/// wanted for which group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgAckRequest {
    pub ids: BTreeSet<ParticipantId>,
    pub group_key: GroupKey,
}

// =============================================================================
// Signature request detail objects
// =============================================================================

/// What to sign and under which sighash scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignDetails {
    pub message: Vec<u8>,
    pub sighash_type: u8,
}

/// One signature wanted by a signatures request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleSignatureDetails {
    pub sign_details: SignDetails,
    pub group_key: GroupKey,
    pub hd_derivation: Vec<u32>,
}

/// Creator-signed description of a batch of wanted signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturesRequestDetails {
    pub required_sigs: Vec<SingleSignatureDetails>,
    pub expiry: Expiry,
}

impl SignaturesRequestDetails {
    /// Stable 16-byte fingerprint of this request, used as its identity.
    pub fn fingerprint(&self) -> Result<RequestId, CryptoError> {
        let digest: [u8; 32] = Sha256::digest(crypto::canonical_bytes(self)?).into();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Ok(RequestId(id))
    }
}

// =============================================================================
// Signing rounds
// =============================================================================

/// The totally-ordered nonce commitments opening one signing round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningCommitmentSet {
    pub commitments: BTreeMap<ParticipantId, SigningCommitment>,
}

impl SigningCommitmentSet {
    /// The set keyed by FROST identifiers, as the aggregation layer wants it.
    pub fn frost_map(&self) -> BTreeMap<FrostIdentifier, SigningCommitment> {
        self.commitments
            .iter()
            .map(|(id, commitment)| (id.frost(), commitment.clone()))
            .collect()
    }

    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.commitments.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.commitments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commitments.is_empty()
    }
}

/// Notification that a signing round has opened for one signature of a
/// request; the recipient owes a share over these commitments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRoundStart {
    pub sig_index: usize,
    pub commitments: SigningCommitmentSet,
}

/// One reply to an open signatures request: the next nonce commitment, plus
/// the share for the currently open round when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureReply {
    pub sig_index: usize,
    pub next_commitment: SigningCommitment,
    pub share: Option<crate::crypto::SignatureShare>,
}

/// Outcome of a `submit_signature_replies` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SignaturesResponse {
    /// Every wanted signature is finished; the batch, in request order.
    Complete(Vec<SchnorrSignature>),
    /// The caller's replies opened new rounds it participates in.
    NewRounds(Vec<SignatureRoundStart>),
    /// Replies accepted; nothing to report to the caller yet.
    Pending,
}

// =============================================================================
// Login snapshot
// =============================================================================

/// A round-1 DKG as presented to a freshly logged-in participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkgSnapshot {
    pub details: Signed<NewDkgDetails>,
    pub creator: ParticipantId,
    pub commitments: Vec<(ParticipantId, DkgCommitment)>,
}

/// An in-flight signatures request as presented at login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigRequestSnapshot {
    pub request_id: RequestId,
    pub details: Signed<SignaturesRequestDetails>,
    pub creator: ParticipantId,
}

/// The rounds of one request in which the logging-in participant owes a
/// share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigRoundsSnapshot {
    pub request_id: RequestId,
    pub rounds: Vec<SignatureRoundStart>,
}

/// A completed signature batch the participant has not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSignaturesInfo {
    pub request_id: RequestId,
    pub details: Signed<SignaturesRequestDetails>,
    pub signatures: Vec<SchnorrSignature>,
    pub creator: ParticipantId,
}

/// A recovery share waiting for the participant, delivered in the login
/// snapshot when the share arrived while they were offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSecretShare {
    pub group_key: GroupKey,
    pub sender: ParticipantId,
    pub key_share: EncryptedKeyShare,
}

/// Everything a client needs to re-hydrate its view at login: the new
/// session, who is online, and the full protocol state addressed to it.
#[derive(Debug)]
pub struct LoginResponse {
    pub session_id: SessionId,
    pub expiry: Expiry,
    pub online_participants: BTreeSet<ParticipantId>,
    /// Live one-way event stream for this session.
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub new_dkgs: Vec<DkgSnapshot>,
    pub sig_requests: Vec<SigRequestSnapshot>,
    pub sig_rounds: Vec<SigRoundsSnapshot>,
    pub completed_sigs: Vec<CompletedSignaturesInfo>,
    pub secret_shares: Vec<PendingSecretShare>,
}

/// Operational counters for the running server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub live_sessions: usize,
    pub pending_challenges: usize,
    pub active_dkgs: usize,
    pub active_sig_requests: usize,
    pub completed_sigs: usize,
}
