//! The owned aggregate of all server-side coordination state.
//!
//! `ServerState` is a value with its lifecycle tied to the request handler;
//! there is no ambient process state. Sessions are reachable both by session
//! id and by participant id through two index maps into the same owned
//! object, and broadcasts walk the session map explicitly.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::cache::{Expiry, ExpirableMap, HasExpiry};
use crate::coordination::dkg::{DkgAckCache, DkgState};
use crate::coordination::events::ServerEvent;
use crate::coordination::session::ClientSession;
use crate::coordination::sharing::KeySharingState;
use crate::coordination::signing::{CompletedSignatures, SignaturesCoordinationState};
use crate::coordination::types::{ChallengeId, ParticipantId, RequestId, SessionId};
use crate::crypto::GroupKey;

/// A login challenge awaiting its signed response.
#[derive(Debug, Clone, Copy)]
pub struct PendingChallenge {
    pub participant: ParticipantId,
    pub expiry: Expiry,
}

impl HasExpiry for PendingChallenge {
    fn expiry(&self) -> Expiry {
        self.expiry
    }
}

/// Aggregate of every expirable map the server owns, plus the
/// participant→session index.
pub struct ServerState {
    pub challenges: ExpirableMap<ChallengeId, PendingChallenge>,
    pub sessions: ExpirableMap<SessionId, ClientSession>,
    pub participant_sessions: BTreeMap<ParticipantId, SessionId>,
    pub dkgs: ExpirableMap<String, DkgState>,
    pub dkg_acks: ExpirableMap<GroupKey, DkgAckCache>,
    pub sig_requests: ExpirableMap<RequestId, SignaturesCoordinationState>,
    pub completed_sigs: ExpirableMap<RequestId, CompletedSignatures>,
    pub key_shares: ExpirableMap<GroupKey, KeySharingState>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            challenges: ExpirableMap::with_eviction_hook(Box::new(|id: &ChallengeId, _| {
                tracing::debug!(challenge = %id, "login challenge expired");
            })),
            sessions: ExpirableMap::new(),
            participant_sessions: BTreeMap::new(),
            dkgs: ExpirableMap::with_eviction_hook(Box::new(|name: &String, _| {
                tracing::info!(name = %name, "DKG expired");
            })),
            dkg_acks: ExpirableMap::with_eviction_hook(Box::new(|key: &GroupKey, _| {
                tracing::debug!(group_key = %key, "acknowledgement cache expired");
            })),
            sig_requests: ExpirableMap::with_eviction_hook(Box::new(|id: &RequestId, _| {
                tracing::info!(request_id = %id, "signatures request expired");
            })),
            completed_sigs: ExpirableMap::with_eviction_hook(Box::new(|id: &RequestId, _| {
                tracing::debug!(request_id = %id, "completed signatures expired");
            })),
            key_shares: ExpirableMap::with_eviction_hook(Box::new(|key: &GroupKey, _| {
                tracing::debug!(group_key = %key, "recovery-share table expired");
            })),
        }
    }

    /// Observe expiry across every map. Expired sessions run the full
    /// end-session side effects; everything else evicts silently.
    pub fn sweep(&mut self) {
        self.challenges.sweep();
        self.dkgs.sweep();
        self.dkg_acks.sweep();
        self.sig_requests.sweep();
        self.completed_sigs.sweep();
        self.key_shares.sweep();

        let expired = self.sessions.sweep();
        let mut lost = Vec::new();
        for (session_id, session) in expired {
            lost.extend(self.finish_session(session_id, session));
        }
        self.reap(lost);
    }

    /// Identifiers of all currently live sessions.
    pub fn online_participants(&mut self) -> BTreeSet<ParticipantId> {
        self.sessions
            .values()
            .map(ClientSession::participant)
            .collect()
    }

    /// The participant behind a live session, if any.
    pub fn session_participant(&mut self, session_id: &SessionId) -> Option<ParticipantId> {
        self.sessions
            .get(session_id)
            .map(ClientSession::participant)
    }

    /// Deliver an event to every live session except `exclude`'s, reaping any
    /// session whose stream turns out to be lost.
    pub fn broadcast(&mut self, event: &ServerEvent, exclude: Option<ParticipantId>) {
        let lost = self.send_to_all(event, exclude);
        self.reap(lost);
    }

    /// Deliver an event to one participant's session, if online. Returns
    /// whether the event was delivered.
    pub fn send_to_participant(&mut self, participant: ParticipantId, event: ServerEvent) -> bool {
        let Some(session_id) = self.participant_sessions.get(&participant).copied() else {
            return false;
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.send_event(event) {
            true
        } else {
            self.reap(vec![session_id]);
            false
        }
    }

    /// End a session by id, running the full side effects.
    pub fn end_session(&mut self, session_id: SessionId) {
        self.reap(vec![session_id]);
    }

    fn send_to_all(
        &mut self,
        event: &ServerEvent,
        exclude: Option<ParticipantId>,
    ) -> Vec<SessionId> {
        let mut lost = Vec::new();
        for (session_id, session) in self.sessions.iter_mut() {
            if Some(session.participant()) == exclude {
                continue;
            }
            if !session.send_event(event.clone()) {
                lost.push(*session_id);
            }
        }
        lost
    }

    /// Remove and finish every queued session, following up on sessions whose
    /// streams are found lost while broadcasting the logouts.
    fn reap(&mut self, lost: Vec<SessionId>) {
        let mut queue: VecDeque<SessionId> = lost.into();
        while let Some(session_id) = queue.pop_front() {
            if let Some(session) = self.sessions.remove(&session_id) {
                queue.extend(self.finish_session(session_id, session));
            }
        }
    }

    /// The end-session side effects, for a session already removed from the
    /// map: drop the participant index, demote in-flight DKGs, close the
    /// sink, and announce the logout to everyone remaining.
    fn finish_session(
        &mut self,
        session_id: SessionId,
        mut session: ClientSession,
    ) -> Vec<SessionId> {
        let participant = session.participant();
        if self.participant_sessions.get(&participant) == Some(&session_id) {
            self.participant_sessions.remove(&participant);
        }
        for dkg in self.dkgs.values_mut() {
            dkg.demote_for_logout(participant);
        }
        session.close();
        tracing::info!(session_id = %session_id, participant = %participant, "session ended");

        self.send_to_all(
            &ServerEvent::ParticipantStatus {
                id: participant,
                logged_in: false,
            },
            None,
        )
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}
