//! Error types for the coordination core.
//!
//! Every protocol-level rule violation surfaces as an [`InvalidRequest`]
//! returned synchronously to the calling client. All variants are recoverable
//! at the caller; none leave the server in a state that rejects future valid
//! requests (the signature-coordination rules deliberately record the caller
//! as malicious *before* raising, which is the intended exclusion mechanism,
//! not corruption).

use thiserror::Error;

/// Protocol-level request rejection, with one variant per rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRequest {
    // Login errors
    #[error("unsupported protocol version {0}")]
    InvalidProtoVersion(u16),

    #[error("group fingerprint does not match the configured group")]
    GroupMismatch,

    #[error("participant is not a member of the configured group")]
    NoParticipant,

    #[error("no session with the given id")]
    NoSession,

    #[error("no pending challenge with the given nonce")]
    NoChallenge,

    #[error("challenge response signature is invalid")]
    InvalidChallengeSig,

    // DKG errors
    #[error("no DKG with the given name")]
    NoDkg,

    #[error("DKG is not in round 1")]
    NotRound1Dkg,

    #[error("DKG is not in round 2")]
    NotRound2Dkg,

    #[error("a DKG with that name already exists")]
    DkgRequestExists,

    #[error("participant already committed to this DKG")]
    DkgCommitmentExists,

    #[error("participant already provided round 2 secrets")]
    DkgRound2Sent,

    #[error("threshold {threshold} is invalid for a group of {group_size}")]
    InvalidThreshold { threshold: u16, group_size: u16 },

    #[error("DKG request signature is invalid")]
    InvalidDkgReqSig,

    #[error("commitment set signature is invalid")]
    InvalidDkgCommitmentSetSig,

    #[error("round 2 secret map does not cover exactly the other participants")]
    InvalidSecretMap,

    // DKG-ACK errors
    #[error("DKG acknowledgement signature is invalid")]
    InvalidDkgAckSig,

    #[error("cannot request an acknowledgement from oneself")]
    CannotRequestSelfAck,

    // Signature request errors
    #[error("commitment count does not match the requested signatures")]
    WrongCommitmentNum,

    #[error("key infos do not match the requested signatures' group keys")]
    WrongSigKeys,

    #[error("a signatures request with that id already exists")]
    SigRequestExists,

    #[error("signatures request signature is invalid")]
    InvalidSigReqSig,

    #[error("requested expiry is sooner than permitted")]
    ExpiryTooSoon,

    #[error("requested expiry is later than permitted")]
    ExpiryTooLate,

    // Signature reply errors
    #[error("participant has been marked malicious for this request")]
    MarkedMalicious,

    #[error("signature reply set is empty")]
    EmptySigReply,

    #[error("signature reply set contains a duplicate signature index")]
    DuplicateSigReply,

    #[error("signature index is out of range")]
    InvalidSigIndex,

    #[error("a next commitment from this participant is already recorded")]
    NextCommitmentExists,

    #[error("share provided without an open round for this participant")]
    UnsolicitedShare,

    #[error("share missing for an open round")]
    MissingShare,

    #[error("signature share failed verification")]
    InvalidShare,

    // Recovery-share errors
    #[error("key share map is empty, self-addressed, or names a non-member")]
    InvalidKeyShareMap,
}

impl InvalidRequest {
    /// Stable machine-readable code for structured error responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidProtoVersion(_) => "INVALID_PROTO_VERSION",
            Self::GroupMismatch => "GROUP_MISMATCH",
            Self::NoParticipant => "NO_PARTICIPANT",
            Self::NoSession => "NO_SESSION",
            Self::NoChallenge => "NO_CHALLENGE",
            Self::InvalidChallengeSig => "INVALID_CHALLENGE_SIG",
            Self::NoDkg => "NO_DKG",
            Self::NotRound1Dkg => "NOT_ROUND1_DKG",
            Self::NotRound2Dkg => "NOT_ROUND2_DKG",
            Self::DkgRequestExists => "DKG_REQUEST_EXISTS",
            Self::DkgCommitmentExists => "DKG_COMMITMENT_EXISTS",
            Self::DkgRound2Sent => "DKG_ROUND2_SENT",
            Self::InvalidThreshold { .. } => "INVALID_THRESHOLD",
            Self::InvalidDkgReqSig => "INVALID_DKG_REQ_SIG",
            Self::InvalidDkgCommitmentSetSig => "INVALID_DKG_COMMITMENT_SET_SIG",
            Self::InvalidSecretMap => "INVALID_SECRET_MAP",
            Self::InvalidDkgAckSig => "INVALID_DKG_ACK_SIG",
            Self::CannotRequestSelfAck => "CANNOT_REQUEST_SELF_ACK",
            Self::WrongCommitmentNum => "WRONG_COMMITMENT_NUM",
            Self::WrongSigKeys => "WRONG_SIG_KEYS",
            Self::SigRequestExists => "SIG_REQUEST_EXISTS",
            Self::InvalidSigReqSig => "INVALID_SIG_REQ_SIG",
            Self::ExpiryTooSoon => "EXPIRY_TOO_SOON",
            Self::ExpiryTooLate => "EXPIRY_TOO_LATE",
            Self::MarkedMalicious => "MARKED_MALICIOUS",
            Self::EmptySigReply => "EMPTY_SIG_REPLY",
            Self::DuplicateSigReply => "DUPLICATE_SIG_REPLY",
            Self::InvalidSigIndex => "INVALID_SIG_INDEX",
            Self::NextCommitmentExists => "NEXT_COMMITMENT_EXISTS",
            Self::UnsolicitedShare => "UNSOLICITED_SHARE",
            Self::MissingShare => "MISSING_SHARE",
            Self::InvalidShare => "INVALID_SHARE",
            Self::InvalidKeyShareMap => "INVALID_KEY_SHARE_MAP",
        }
    }
}

/// Result type alias for request handling.
pub type RequestResult<T> = Result<T, InvalidRequest>;
