//! The request handler driving the coordination protocol.
//!
//! The coordinator owns all server state and processes requests one at a
//! time: exclusive access through `&mut self` is the sequential-processing
//! contract, so no request ever observes another's partial state. It
//! validates protocol-level well-formedness, mutates state, and fans events
//! out to the affected sessions. It never learns a secret share and never
//! produces a signature itself.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::{Expiry, HasExpiry};
use crate::config::{PROTOCOL_VERSION, ServerConfig};
use crate::coordination::dkg::{DkgAckCache, DkgRoundState, DkgState};
use crate::coordination::events::ServerEvent;
use crate::coordination::session::ClientSession;
use crate::coordination::sharing::KeySharingState;
use crate::coordination::signing::{
    CompletedSignatures, InProgressSignature, SignaturesCoordinationState, SingleSignatureState,
};
use crate::coordination::state::{PendingChallenge, ServerState};
use crate::coordination::types::{
    AuthChallenge, CompletedSignaturesInfo, DkgAckRequest, DkgSnapshot, LoginChallenge,
    LoginResponse, NewDkgDetails, ParticipantId, PendingSecretShare, RequestId, SessionId,
    ServerStats, SigRequestSnapshot, SigRoundsSnapshot, SignatureReply, SignatureRoundStart,
    SignaturesRequestDetails, SignaturesResponse, SignedDkgAck, SingleSignatureDetails,
};
use crate::crypto::{
    self, AggregateKeyInfo, DkgCommitment, DkgEncryptedSecret, EncryptedKeyShare, FrostIdentifier,
    GroupKey, IdentitySignature, SchnorrSignature, SignatureShare, Signed, SigningCommitment,
};
use crate::error::{InvalidRequest, RequestResult};

/// The coordination state machine behind the service.
pub struct Coordinator {
    config: ServerConfig,
    state: ServerState,
}

// Allow unused_async: handlers are async for transport-layer compatibility;
// suspension only ever happens around event delivery and the cryptographic
// primitives, both of which are non-blocking today.
#[allow(clippy::unused_async)]
impl Coordinator {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: ServerState::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Operational counters after a sweep.
    pub fn stats(&mut self) -> ServerStats {
        self.state.sweep();
        ServerStats {
            live_sessions: self.state.sessions.len(),
            pending_challenges: self.state.challenges.len(),
            active_dkgs: self.state.dkgs.len(),
            active_sig_requests: self.state.sig_requests.len(),
            completed_sigs: self.state.completed_sigs.len(),
        }
    }

    // =========================================================================
    // Login and session lifecycle
    // =========================================================================

    /// Open a login: validate the caller's claim to a group slot and hand
    /// back a fresh challenge to sign.
    pub async fn login(
        &mut self,
        group_fingerprint: [u8; 32],
        participant: ParticipantId,
        protocol_version: u16,
    ) -> RequestResult<LoginChallenge> {
        self.state.sweep();
        if protocol_version != PROTOCOL_VERSION {
            return Err(InvalidRequest::InvalidProtoVersion(protocol_version));
        }
        if group_fingerprint != self.config.group.fingerprint() {
            return Err(InvalidRequest::GroupMismatch);
        }
        if !self.config.group.contains(participant) {
            return Err(InvalidRequest::NoParticipant);
        }

        let nonce = Uuid::new_v4();
        let expiry = Expiry::from_ttl(self.config.challenge_ttl);
        self.state
            .challenges
            .insert(nonce, PendingChallenge { participant, expiry });
        tracing::debug!(participant = %participant, "login challenge issued");

        Ok(LoginChallenge {
            challenge: AuthChallenge { nonce },
            expiry,
        })
    }

    /// Complete a login with the signed challenge, evicting any previous
    /// session of the same participant, and return the re-hydration snapshot
    /// plus the live event stream.
    pub async fn respond_to_challenge(
        &mut self,
        response: Signed<AuthChallenge>,
    ) -> RequestResult<LoginResponse> {
        self.state.sweep();
        let nonce = response.obj.nonce;
        let challenge = self
            .state
            .challenges
            .get(&nonce)
            .copied()
            .ok_or(InvalidRequest::NoChallenge)?;
        let participant = challenge.participant;
        let public_key = self
            .config
            .group
            .public_key(participant)
            .ok_or(InvalidRequest::NoParticipant)?;
        response
            .verify(public_key)
            .map_err(|_| InvalidRequest::InvalidChallengeSig)?;
        self.state.challenges.remove(&nonce);

        // Re-login evicts the previous session, and peers must observe that
        // logout before the new login.
        if let Some(old) = self.state.participant_sessions.get(&participant).copied() {
            self.state.end_session(old);
        }

        let online_participants = self.state.online_participants();
        self.state.broadcast(
            &ServerEvent::ParticipantStatus {
                id: participant,
                logged_in: true,
            },
            None,
        );

        let session_id = Uuid::new_v4();
        let expiry = Expiry::from_ttl(self.config.session_ttl);
        let mut session = ClientSession::new(participant, session_id, expiry);
        let events = session.attach(self.config.keep_alive_freq);

        // Snapshot the server's view at the instant the session is installed;
        // everything later arrives over the live stream.
        let new_dkgs = self.snapshot_round1_dkgs();
        let (sig_requests, sig_rounds) = self.snapshot_sig_requests(participant);
        let completed_sigs = self.snapshot_completed(participant);
        let secret_shares = self.snapshot_secret_shares(participant);

        self.state.sessions.insert(session_id, session);
        self.state.participant_sessions.insert(participant, session_id);
        tracing::info!(session_id = %session_id, participant = %participant, "session created");

        Ok(LoginResponse {
            session_id,
            expiry,
            online_participants,
            events,
            new_dkgs,
            sig_requests,
            sig_rounds,
            completed_sigs,
            secret_shares,
        })
    }

    /// Refresh a session's deadline.
    pub async fn extend_session(&mut self, session_id: SessionId) -> RequestResult<Expiry> {
        self.state.sweep();
        let expiry = Expiry::from_ttl(self.config.session_ttl);
        let session = self
            .state
            .sessions
            .get_mut(&session_id)
            .ok_or(InvalidRequest::NoSession)?;
        session.extend(expiry);
        Ok(expiry)
    }

    /// Re-attach the event stream of an existing session, flushing any
    /// events buffered while no subscriber was listening.
    pub async fn subscribe_events(
        &mut self,
        session_id: SessionId,
    ) -> RequestResult<mpsc::UnboundedReceiver<ServerEvent>> {
        self.state.sweep();
        let keep_alive = self.config.keep_alive_freq;
        let session = self
            .state
            .sessions
            .get_mut(&session_id)
            .ok_or(InvalidRequest::NoSession)?;
        Ok(session.attach(keep_alive))
    }

    /// Explicitly end a session, running the full end-session side effects.
    pub async fn logout(&mut self, session_id: SessionId) -> RequestResult<()> {
        self.state.sweep();
        if self.state.sessions.get(&session_id).is_none() {
            return Err(InvalidRequest::NoSession);
        }
        self.state.end_session(session_id);
        Ok(())
    }

    // =========================================================================
    // DKG
    // =========================================================================

    /// Open a new named DKG, seeded with the creator's round-1 commitment.
    pub async fn request_new_dkg(
        &mut self,
        session_id: SessionId,
        signed_details: Signed<NewDkgDetails>,
        commitment: DkgCommitment,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        let group_size = self.config.group.size();
        let details = &signed_details.obj;
        if details.threshold == 0 || details.threshold > group_size {
            return Err(InvalidRequest::InvalidThreshold {
                threshold: details.threshold,
                group_size,
            });
        }
        self.check_ttl(
            &details.expiry,
            self.config.min_dkg_request_ttl,
            self.config.max_dkg_request_ttl,
        )?;
        if self.state.dkgs.contains_key(&details.name) {
            return Err(InvalidRequest::DkgRequestExists);
        }
        let public_key = self
            .config
            .group
            .public_key(participant)
            .ok_or(InvalidRequest::NoParticipant)?;
        signed_details
            .verify(public_key)
            .map_err(|_| InvalidRequest::InvalidDkgReqSig)?;

        let name = details.name.clone();
        let threshold = details.threshold;
        let dkg = DkgState::new(signed_details.clone(), participant, commitment.clone());
        self.state.dkgs.insert(name.clone(), dkg);
        tracing::info!(name = %name, creator = %participant, threshold, "DKG requested");

        self.state.broadcast(
            &ServerEvent::NewDkg {
                details: signed_details,
                creator: participant,
                commitments: vec![(participant, commitment)],
            },
            Some(participant),
        );
        Ok(())
    }

    /// Reject a DKG by name. A missing DKG is a no-op: rejection races with
    /// completion and expiry by design.
    pub async fn reject_dkg(&mut self, session_id: SessionId, name: &str) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        let key = name.to_string();
        if self.state.dkgs.remove(&key).is_some() {
            tracing::info!(name = %name, participant = %participant, "DKG rejected");
            self.state.broadcast(
                &ServerEvent::DkgReject {
                    name: key,
                    participant,
                },
                Some(participant),
            );
        }
        Ok(())
    }

    /// Record a round-1 commitment; the last one advances the DKG to round 2.
    pub async fn submit_dkg_commitment(
        &mut self,
        session_id: SessionId,
        name: &str,
        commitment: DkgCommitment,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        let group_size = self.config.group.size();
        let key = name.to_string();
        let dkg = self
            .state
            .dkgs
            .get_mut(&key)
            .ok_or(InvalidRequest::NoDkg)?;
        if !matches!(dkg.round, DkgRoundState::Round1 { .. }) {
            return Err(InvalidRequest::NotRound1Dkg);
        }
        if dkg.has_commitment(participant) {
            return Err(InvalidRequest::DkgCommitmentExists);
        }
        dkg.push_commitment(participant, commitment.clone(), group_size)
            .map_err(|_| InvalidRequest::InvalidDkgReqSig)?;
        let advanced = matches!(dkg.round, DkgRoundState::Round2 { .. });
        if advanced {
            tracing::info!(name = %name, "DKG round 1 complete, advancing to round 2");
        }

        self.state.broadcast(
            &ServerEvent::DkgCommitment {
                name: key,
                participant,
                commitment,
            },
            Some(participant),
        );
        Ok(())
    }

    /// Accept one participant's round-2 output: a signature binding the
    /// commitment set, plus one encrypted secret per other participant,
    /// routed to whoever is online. The last submission deletes the DKG; the
    /// server never retains key material.
    pub async fn submit_dkg_round2(
        &mut self,
        session_id: SessionId,
        name: &str,
        commitment_set_signature: IdentitySignature,
        secrets: BTreeMap<ParticipantId, DkgEncryptedSecret>,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        let public_key = *self
            .config
            .group
            .public_key(participant)
            .ok_or(InvalidRequest::NoParticipant)?;
        let group_size = self.config.group.size() as usize;
        let others: BTreeSet<ParticipantId> = self
            .config
            .group
            .participants
            .keys()
            .copied()
            .filter(|id| *id != participant)
            .collect();

        let key = name.to_string();
        let dkg = self
            .state
            .dkgs
            .get_mut(&key)
            .ok_or(InvalidRequest::NoDkg)?;
        let DkgRoundState::Round2 {
            expected_hash,
            participants_provided,
        } = &mut dkg.round
        else {
            return Err(InvalidRequest::NotRound2Dkg);
        };
        let expected = *expected_hash;
        crypto::verify_detached(&public_key, &expected, &commitment_set_signature)
            .map_err(|_| InvalidRequest::InvalidDkgCommitmentSetSig)?;
        if participants_provided.contains(&participant) {
            return Err(InvalidRequest::DkgRound2Sent);
        }
        if secrets.keys().copied().collect::<BTreeSet<_>>() != others {
            return Err(InvalidRequest::InvalidSecretMap);
        }

        let done = participants_provided.len() + 1 == group_size;
        if done {
            self.state.dkgs.remove(&key);
            tracing::info!(name = %name, "DKG round 2 complete, removing");
        } else {
            participants_provided.insert(participant);
        }

        // Offline recipients miss their share; correctness relies on the
        // logout demotion rule keeping everyone online through both rounds.
        for (receiver, secret) in secrets {
            self.state.send_to_participant(
                receiver,
                ServerEvent::DkgRound2Share {
                    name: key.clone(),
                    commitment_set_signature: commitment_set_signature.clone(),
                    sender: participant,
                    secret,
                },
            );
        }
        Ok(())
    }

    // =========================================================================
    // DKG acknowledgements
    // =========================================================================

    /// Cache signed acknowledgements and fan the new ones out. A `false`
    /// acknowledgement can upgrade to `true`, never the reverse.
    pub async fn send_dkg_acks(
        &mut self,
        session_id: SessionId,
        acks: Vec<SignedDkgAck>,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        // Any bad signature fails the whole call before the cache changes.
        for ack in &acks {
            let key = self
                .config
                .group
                .public_key(ack.signer)
                .ok_or(InvalidRequest::InvalidDkgAckSig)?;
            ack.signed
                .verify(key)
                .map_err(|_| InvalidRequest::InvalidDkgAckSig)?;
        }

        let ack_ttl = self.config.ack_cache_ttl;
        let mut new_acks: Vec<SignedDkgAck> = Vec::new();
        for ack in acks {
            let group_key = ack.signed.obj.group_key.clone();
            let cache = self
                .state
                .dkg_acks
                .get_or_insert_with(group_key, || DkgAckCache::new(Expiry::from_ttl(ack_ttl)));
            if cache.upsert(ack.signer, ack.signed.clone()) {
                new_acks.push(ack);
            }
        }
        if new_acks.is_empty() {
            return Ok(());
        }

        let recipients: Vec<ParticipantId> = self
            .state
            .online_participants()
            .into_iter()
            .filter(|id| *id != participant)
            .collect();
        for recipient in recipients {
            let subset: Vec<SignedDkgAck> = new_acks
                .iter()
                .filter(|ack| ack.signer != recipient)
                .cloned()
                .collect();
            if subset.is_empty() {
                continue;
            }
            self.state
                .send_to_participant(recipient, ServerEvent::DkgAcks { acks: subset });
        }
        Ok(())
    }

    /// Return the cached acknowledgements the caller asked for and broadcast
    /// a request for the rest.
    pub async fn request_dkg_acks(
        &mut self,
        session_id: SessionId,
        requests: Vec<DkgAckRequest>,
    ) -> RequestResult<Vec<SignedDkgAck>> {
        let participant = self.require_session(session_id)?;
        for request in &requests {
            for id in &request.ids {
                if !self.config.group.contains(*id) {
                    return Err(InvalidRequest::NoParticipant);
                }
                if *id == participant {
                    return Err(InvalidRequest::CannotRequestSelfAck);
                }
            }
        }

        let mut have: Vec<SignedDkgAck> = Vec::new();
        let mut remaining: Vec<DkgAckRequest> = Vec::new();
        for request in requests {
            let cache = self.state.dkg_acks.get(&request.group_key);
            let mut need: BTreeSet<ParticipantId> = BTreeSet::new();
            for id in request.ids {
                match cache.and_then(|cache| cache.acks.get(&id)) {
                    Some(signed) => have.push(SignedDkgAck {
                        signer: id,
                        signed: signed.clone(),
                    }),
                    None => {
                        need.insert(id);
                    }
                }
            }
            if !need.is_empty() {
                remaining.push(DkgAckRequest {
                    ids: need,
                    group_key: request.group_key,
                });
            }
        }

        if !remaining.is_empty() {
            self.state.broadcast(
                &ServerEvent::DkgAckRequest {
                    requests: remaining,
                },
                Some(participant),
            );
        }
        Ok(have)
    }

    // =========================================================================
    // ROAST signature coordination
    // =========================================================================

    /// Open a signatures request, seeding each wanted signature's commitment
    /// pipeline with the creator's commitments.
    pub async fn request_signatures(
        &mut self,
        session_id: SessionId,
        keys: Vec<AggregateKeyInfo>,
        signed_details: Signed<SignaturesRequestDetails>,
        commitments: Vec<SigningCommitment>,
    ) -> RequestResult<RequestId> {
        let participant = self.require_session(session_id)?;
        let details = &signed_details.obj;
        if commitments.len() != details.required_sigs.len() {
            return Err(InvalidRequest::WrongCommitmentNum);
        }
        let wanted: BTreeSet<&GroupKey> =
            details.required_sigs.iter().map(|sig| &sig.group_key).collect();
        let offered: BTreeSet<&GroupKey> = keys.iter().map(|key| &key.group_key).collect();
        if wanted != offered {
            return Err(InvalidRequest::WrongSigKeys);
        }
        self.check_ttl(
            &details.expiry,
            self.config.min_signatures_request_ttl,
            self.config.max_signatures_request_ttl,
        )?;
        let request_id = details
            .fingerprint()
            .map_err(|_| InvalidRequest::InvalidSigReqSig)?;
        if self.state.sig_requests.contains_key(&request_id)
            || self.state.completed_sigs.contains_key(&request_id)
        {
            return Err(InvalidRequest::SigRequestExists);
        }
        let public_key = self
            .config
            .group
            .public_key(participant)
            .ok_or(InvalidRequest::NoParticipant)?;
        signed_details
            .verify(public_key)
            .map_err(|_| InvalidRequest::InvalidSigReqSig)?;

        let mut sigs = Vec::with_capacity(details.required_sigs.len());
        for (single, commitment) in details.required_sigs.iter().zip(commitments) {
            let key_info = keys
                .iter()
                .find(|key| key.group_key == single.group_key)
                .ok_or(InvalidRequest::WrongSigKeys)?;
            let mut in_progress = InProgressSignature::new(key_info.clone());
            in_progress.next_commitments.insert(participant, commitment);
            sigs.push(SingleSignatureState::InProgress(in_progress));
        }
        let coordination = SignaturesCoordinationState {
            request_id,
            signed_details: signed_details.clone(),
            creator: participant,
            keys,
            sigs,
            malicious: BTreeSet::new(),
            rejectors: BTreeSet::new(),
        };
        self.state.sig_requests.insert(request_id, coordination);
        tracing::info!(
            request_id = %request_id,
            creator = %participant,
            sigs = signed_details.obj.required_sigs.len(),
            "signatures requested"
        );

        self.state.broadcast(
            &ServerEvent::SignaturesRequest {
                request_id,
                details: signed_details,
                creator: participant,
            },
            Some(participant),
        );
        Ok(request_id)
    }

    /// Decline to sign. Rejections are revocable (a later reply rejoins), a
    /// missing request is a no-op, and the creator may reject their own
    /// request. The request aborts as soon as the remaining pool cannot meet
    /// the highest threshold still in play.
    pub async fn reject_signatures_request(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        let Some(mut coordination) = self.state.sig_requests.remove(&request_id) else {
            return Ok(());
        };
        if coordination.malicious.contains(&participant) {
            self.state.sig_requests.insert(request_id, coordination);
            return Ok(());
        }
        coordination.rejectors.insert(participant);
        tracing::debug!(request_id = %request_id, participant = %participant, "request rejected");
        if coordination.availability_failed(self.config.group.size()) {
            tracing::warn!(request_id = %request_id, "signatures request aborted: pool below threshold");
            self.state
                .broadcast(&ServerEvent::SignaturesFailure { request_id }, None);
        } else {
            self.state.sig_requests.insert(request_id, coordination);
        }
        Ok(())
    }

    /// Process a batch of signature replies: shares for open rounds, plus the
    /// commitments that pipeline the next round one step ahead.
    pub async fn submit_signature_replies(
        &mut self,
        session_id: SessionId,
        request_id: RequestId,
        replies: Vec<SignatureReply>,
    ) -> RequestResult<SignaturesResponse> {
        let participant = self.require_session(session_id)?;
        let Some(mut coordination) = self.state.sig_requests.remove(&request_id) else {
            // Races with completion and expiry are benign.
            return Ok(SignaturesResponse::Pending);
        };
        if coordination.malicious.contains(&participant) {
            self.state.sig_requests.insert(request_id, coordination);
            return Err(InvalidRequest::MarkedMalicious);
        }
        // Replying is re-acceptance; it narrows the failure count right away.
        coordination.rejectors.remove(&participant);

        if replies.is_empty() {
            return Err(self.punish(
                request_id,
                coordination,
                participant,
                InvalidRequest::EmptySigReply,
            ));
        }
        let mut seen = BTreeSet::new();
        if replies.iter().any(|reply| !seen.insert(reply.sig_index)) {
            return Err(self.punish(
                request_id,
                coordination,
                participant,
                InvalidRequest::DuplicateSigReply,
            ));
        }

        let mut new_round_starts: BTreeMap<ParticipantId, Vec<SignatureRoundStart>> =
            BTreeMap::new();

        for reply in replies {
            if reply.sig_index >= coordination.sigs.len() {
                return Err(self.punish(
                    request_id,
                    coordination,
                    participant,
                    InvalidRequest::InvalidSigIndex,
                ));
            }
            let single = coordination.signed_details.obj.required_sigs[reply.sig_index].clone();

            let mut finished: Option<SchnorrSignature> = None;
            {
                let SingleSignatureState::InProgress(sig) =
                    &mut coordination.sigs[reply.sig_index]
                else {
                    // Replies for already-finished signatures are ignored.
                    continue;
                };
                if sig.next_commitments.contains_key(&participant) {
                    return Err(self.punish(
                        request_id,
                        coordination,
                        participant,
                        InvalidRequest::NextCommitmentExists,
                    ));
                }
                match sig.round_for.get(&participant).copied() {
                    None => {
                        if reply.share.is_some() {
                            return Err(self.punish(
                                request_id,
                                coordination,
                                participant,
                                InvalidRequest::UnsolicitedShare,
                            ));
                        }
                    }
                    Some(round_index) => {
                        let Some(share) = reply.share else {
                            return Err(self.punish(
                                request_id,
                                coordination,
                                participant,
                                InvalidRequest::MissingShare,
                            ));
                        };
                        let frost_commitments =
                            sig.rounds[round_index].commitments.frost_map();
                        let verified = Self::verify_share(
                            &sig.key,
                            &single,
                            participant,
                            &share,
                            &frost_commitments,
                        );
                        let Some(derived_package) = verified else {
                            return Err(self.punish(
                                request_id,
                                coordination,
                                participant,
                                InvalidRequest::InvalidShare,
                            ));
                        };

                        let round = &mut sig.rounds[round_index];
                        round.shares.push((participant, share));
                        if round.shares.len() == sig.key.threshold as usize {
                            let shares: BTreeMap<FrostIdentifier, SignatureShare> = round
                                .shares
                                .iter()
                                .map(|(id, share)| (id.frost(), share.clone()))
                                .collect();
                            match crypto::aggregate_signature(
                                &frost_commitments,
                                &single.sign_details.message,
                                &shares,
                                &derived_package,
                            ) {
                                Ok(signature) => finished = Some(signature),
                                Err(_) => {
                                    return Err(self.punish(
                                        request_id,
                                        coordination,
                                        participant,
                                        InvalidRequest::InvalidShare,
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if let Some(signature) = finished {
                tracing::info!(request_id = %request_id, sig_index = reply.sig_index, "signature finished");
                coordination.sigs[reply.sig_index] =
                    SingleSignatureState::Finished { signature };
                continue;
            }

            // Still in progress: pipeline the next commitment, and open a new
            // round the moment a full commitment set is on hand.
            if let SingleSignatureState::InProgress(sig) =
                &mut coordination.sigs[reply.sig_index]
            {
                sig.next_commitments
                    .insert(participant, reply.next_commitment);
                if sig.next_commitments.len() == sig.key.threshold as usize {
                    let snapshot = sig.open_round();
                    tracing::debug!(
                        request_id = %request_id,
                        sig_index = reply.sig_index,
                        members = snapshot.len(),
                        "signing round opened"
                    );
                    for member in snapshot.participants() {
                        new_round_starts
                            .entry(member)
                            .or_default()
                            .push(SignatureRoundStart {
                                sig_index: reply.sig_index,
                                commitments: snapshot.clone(),
                            });
                    }
                }
            }
        }

        if let Some(signatures) = coordination.all_finished() {
            let expiry = coordination
                .expiry()
                .later_of(Expiry::from_ttl(self.config.min_completed_signatures_ttl));
            let completed = CompletedSignatures {
                signed_details: coordination.signed_details.clone(),
                signatures: signatures.clone(),
                creator: coordination.creator,
                acks: BTreeSet::new(),
                expiry,
            };
            self.state.completed_sigs.insert(request_id, completed);
            tracing::info!(request_id = %request_id, "signatures request complete");
            self.state.broadcast(
                &ServerEvent::SignaturesComplete {
                    request_id,
                    signatures: signatures.clone(),
                },
                Some(participant),
            );
            return Ok(SignaturesResponse::Complete(signatures));
        }

        self.state.sig_requests.insert(request_id, coordination);
        if new_round_starts.is_empty() {
            return Ok(SignaturesResponse::Pending);
        }
        let caller_rounds = new_round_starts.remove(&participant);
        for (member, rounds) in new_round_starts {
            self.state.send_to_participant(
                member,
                ServerEvent::SignatureNewRounds { request_id, rounds },
            );
        }
        Ok(match caller_rounds {
            Some(rounds) => SignaturesResponse::NewRounds(rounds),
            None => SignaturesResponse::Pending,
        })
    }

    // =========================================================================
    // Recovery-share routing
    // =========================================================================

    /// Route encrypted recovery shares toward their receivers, dropping any
    /// the receiver already has from this sender. Offline receivers pick
    /// theirs up in the next login snapshot.
    pub async fn share_secret_share(
        &mut self,
        session_id: SessionId,
        group_key: GroupKey,
        encrypted_secrets: BTreeMap<ParticipantId, EncryptedKeyShare>,
    ) -> RequestResult<()> {
        let participant = self.require_session(session_id)?;
        if encrypted_secrets.is_empty()
            || encrypted_secrets.contains_key(&participant)
            || encrypted_secrets
                .keys()
                .any(|id| !self.config.group.contains(*id))
        {
            return Err(InvalidRequest::InvalidKeyShareMap);
        }

        let retention = self.config.min_completed_signatures_ttl;
        let kept: Vec<(ParticipantId, EncryptedKeyShare)> = {
            let table = self
                .state
                .key_shares
                .get_or_insert_with(group_key.clone(), || {
                    KeySharingState::new(Expiry::from_ttl(retention))
                });
            table.expiry = Expiry::from_ttl(retention);
            encrypted_secrets
                .into_iter()
                .filter(|(receiver, share)| table.offer(*receiver, participant, share.clone()))
                .collect()
        };

        for (receiver, key_share) in kept {
            self.state.send_to_participant(
                receiver,
                ServerEvent::SecretShare {
                    group_key: group_key.clone(),
                    sender: participant,
                    key_share,
                },
            );
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Sweep, then resolve the caller behind a session id.
    fn require_session(&mut self, session_id: SessionId) -> RequestResult<ParticipantId> {
        self.state.sweep();
        self.state
            .session_participant(&session_id)
            .ok_or(InvalidRequest::NoSession)
    }

    fn check_ttl(&self, expiry: &Expiry, min: Duration, max: Duration) -> RequestResult<()> {
        let ttl = expiry.ttl();
        let min = chrono::Duration::from_std(min).unwrap_or(chrono::Duration::MAX);
        let max = chrono::Duration::from_std(max).unwrap_or(chrono::Duration::MAX);
        if ttl < min {
            return Err(InvalidRequest::ExpiryTooSoon);
        }
        if ttl > max {
            return Err(InvalidRequest::ExpiryTooLate);
        }
        Ok(())
    }

    /// Mark a participant malicious for a request, abort the request if the
    /// remaining pool can no longer meet the highest open threshold, and pass
    /// the rejection through.
    fn punish(
        &mut self,
        request_id: RequestId,
        mut coordination: SignaturesCoordinationState,
        participant: ParticipantId,
        error: InvalidRequest,
    ) -> InvalidRequest {
        coordination.mark_malicious(participant);
        tracing::warn!(
            request_id = %request_id,
            participant = %participant,
            reason = error.error_code(),
            "participant marked malicious"
        );
        if coordination.availability_failed(self.config.group.size()) {
            tracing::warn!(request_id = %request_id, "signatures request aborted: pool below threshold");
            self.state
                .broadcast(&ServerEvent::SignaturesFailure { request_id }, None);
        } else {
            self.state.sig_requests.insert(request_id, coordination);
        }
        error
    }

    /// Verify one share against the HD-derived child key. Returns the derived
    /// public key package for aggregation, or `None` when anything about the
    /// share fails to check out.
    fn verify_share(
        key: &AggregateKeyInfo,
        single: &SingleSignatureDetails,
        participant: ParticipantId,
        share: &SignatureShare,
        frost_commitments: &BTreeMap<FrostIdentifier, SigningCommitment>,
    ) -> Option<frost_secp256k1_tr::keys::PublicKeyPackage> {
        let derived = key.derive(&single.hd_derivation).ok()?;
        let verifying_share = derived.verifying_shares.get(&participant.get())?;
        crypto::verify_signature_share(
            participant.frost(),
            verifying_share,
            share,
            frost_commitments,
            &single.sign_details.message,
            &derived.group_key,
        )
        .then_some(derived.public_key_package)
    }

    // Login snapshot builders

    fn snapshot_round1_dkgs(&mut self) -> Vec<DkgSnapshot> {
        let mut snapshots = Vec::new();
        for dkg in self.state.dkgs.values() {
            if let DkgRoundState::Round1 { commitments } = &dkg.round {
                snapshots.push(DkgSnapshot {
                    details: dkg.signed_details.clone(),
                    creator: dkg.creator,
                    commitments: commitments.clone(),
                });
            }
        }
        snapshots
    }

    fn snapshot_sig_requests(
        &mut self,
        participant: ParticipantId,
    ) -> (Vec<SigRequestSnapshot>, Vec<SigRoundsSnapshot>) {
        let mut requests = Vec::new();
        let mut rounds = Vec::new();
        for coordination in self.state.sig_requests.values() {
            requests.push(SigRequestSnapshot {
                request_id: coordination.request_id,
                details: coordination.signed_details.clone(),
                creator: coordination.creator,
            });
            let owed = coordination.pending_rounds_for(participant);
            if !owed.is_empty() {
                rounds.push(SigRoundsSnapshot {
                    request_id: coordination.request_id,
                    rounds: owed,
                });
            }
        }
        (requests, rounds)
    }

    fn snapshot_completed(&mut self, participant: ParticipantId) -> Vec<CompletedSignaturesInfo> {
        let mut snapshots = Vec::new();
        for (request_id, completed) in self.state.completed_sigs.iter() {
            if completed.acks.contains(&participant) {
                continue;
            }
            snapshots.push(CompletedSignaturesInfo {
                request_id: *request_id,
                details: completed.signed_details.clone(),
                signatures: completed.signatures.clone(),
                creator: completed.creator,
            });
        }
        snapshots
    }

    fn snapshot_secret_shares(&mut self, participant: ParticipantId) -> Vec<PendingSecretShare> {
        let mut shares = Vec::new();
        for (group_key, table) in self.state.key_shares.iter() {
            let Some(pending) = table.pending_for(participant) else {
                continue;
            };
            for (sender, key_share) in pending {
                shares.push(PendingSecretShare {
                    group_key: group_key.clone(),
                    sender: *sender,
                    key_share: key_share.clone(),
                });
            }
        }
        shares
    }
}
