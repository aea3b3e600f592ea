//! Server-push events.
//!
//! Exactly one long-lived unidirectional event stream exists per session.
//! Events are validated at construction; clients trust their own server to
//! broadcast only well-formed ones.

use serde::{Deserialize, Serialize};

use crate::coordination::types::{
    DkgAckRequest, NewDkgDetails, ParticipantId, RequestId, SignatureRoundStart,
    SignaturesRequestDetails, SignedDkgAck,
};
use crate::crypto::{
    DkgCommitment, DkgEncryptedSecret, EncryptedKeyShare, GroupKey, IdentitySignature,
    SchnorrSignature, Signed,
};

/// The tagged union pushed over per-session event streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A peer logged in or out.
    ParticipantStatus {
        id: ParticipantId,
        logged_in: bool,
    },
    /// A new DKG was requested; round 1 is open.
    NewDkg {
        details: Signed<NewDkgDetails>,
        creator: ParticipantId,
        commitments: Vec<(ParticipantId, DkgCommitment)>,
    },
    /// A peer committed to a round-1 DKG.
    DkgCommitment {
        name: String,
        participant: ParticipantId,
        commitment: DkgCommitment,
    },
    /// A peer rejected a DKG; it no longer exists on the server.
    DkgReject {
        name: String,
        participant: ParticipantId,
    },
    /// A round-2 secret addressed to the receiving session's participant.
    DkgRound2Share {
        name: String,
        commitment_set_signature: IdentitySignature,
        sender: ParticipantId,
        secret: DkgEncryptedSecret,
    },
    /// Newly cached acknowledgements from other participants.
    DkgAcks {
        acks: Vec<SignedDkgAck>,
    },
    /// A peer wants acknowledgements the server does not have cached.
    DkgAckRequest {
        requests: Vec<DkgAckRequest>,
    },
    /// A new signatures request is open for replies.
    SignaturesRequest {
        request_id: RequestId,
        details: Signed<SignaturesRequestDetails>,
        creator: ParticipantId,
    },
    /// Signing rounds opened that include the receiving participant.
    SignatureNewRounds {
        request_id: RequestId,
        rounds: Vec<SignatureRoundStart>,
    },
    /// A signatures request finished; the batch in request order.
    SignaturesComplete {
        request_id: RequestId,
        signatures: Vec<SchnorrSignature>,
    },
    /// A signatures request was aborted: the remaining pool cannot meet the
    /// highest threshold in play.
    SignaturesFailure {
        request_id: RequestId,
    },
    /// A recovery share addressed to the receiving session's participant.
    SecretShare {
        group_key: GroupKey,
        sender: ParticipantId,
        key_share: EncryptedKeyShare,
    },
    Keepalive,
}

impl ServerEvent {
    /// Short tag used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParticipantStatus { .. } => "participant_status",
            Self::NewDkg { .. } => "new_dkg",
            Self::DkgCommitment { .. } => "dkg_commitment",
            Self::DkgReject { .. } => "dkg_reject",
            Self::DkgRound2Share { .. } => "dkg_round2_share",
            Self::DkgAcks { .. } => "dkg_acks",
            Self::DkgAckRequest { .. } => "dkg_ack_request",
            Self::SignaturesRequest { .. } => "signatures_request",
            Self::SignatureNewRounds { .. } => "signature_new_rounds",
            Self::SignaturesComplete { .. } => "signatures_complete",
            Self::SignaturesFailure { .. } => "signatures_failure",
            Self::SecretShare { .. } => "secret_share",
            Self::Keepalive => "keepalive",
        }
    }
}
