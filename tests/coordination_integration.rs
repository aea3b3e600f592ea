//! Integration tests for the coordination core.
//!
//! These tests drive the actual `Coordinator` through full login, DKG,
//! acknowledgement, ROAST signing, and recovery-share flows with ten
//! participants, playing the client side with real FROST key material where
//! shares must verify.
//!
//! Run with: cargo test --test `coordination_integration`

use std::collections::BTreeMap;
use std::time::Duration;

use assert_matches::assert_matches;
use frost_secp256k1_tr as frost;
use rand::rngs::OsRng;

use roast_coordinator::cache::Expiry;
use roast_coordinator::config::{GroupConfig, PROTOCOL_VERSION, ServerConfig};
use roast_coordinator::coordination::types::{
    AuthChallenge, DkgAck, DkgAckRequest, LoginResponse, NewDkgDetails, ParticipantId, RequestId,
    SignDetails, SignatureReply, SignaturesRequestDetails, SignaturesResponse, SignedDkgAck,
    SigningCommitmentSet, SingleSignatureDetails,
};
use roast_coordinator::coordination::Coordinator;
use roast_coordinator::crypto::{
    AggregateKeyInfo, DkgCommitment, DkgEncryptedSecret, EncryptedKeyShare, GroupKey,
    IdentityKeypair, Signed, SigningCommitment, hash_with_commitments,
};
use roast_coordinator::error::InvalidRequest;
use roast_coordinator::ServerEvent;

const GROUP_SIZE: u16 = 10;

struct TestGroup {
    keypairs: BTreeMap<ParticipantId, IdentityKeypair>,
}

impl TestGroup {
    fn keypair(&self, id: u16) -> &IdentityKeypair {
        &self.keypairs[&participant(id)]
    }
}

fn participant(id: u16) -> ParticipantId {
    ParticipantId::new_unwrap(id)
}

fn test_coordinator(n: u16) -> (Coordinator, TestGroup) {
    let keypairs: BTreeMap<ParticipantId, IdentityKeypair> = (1..=n)
        .map(|i| (participant(i), IdentityKeypair::generate(&mut OsRng)))
        .collect();
    let group = GroupConfig {
        id: "test-group".to_string(),
        participants: keypairs
            .iter()
            .map(|(id, keypair)| (*id, keypair.verifying_key()))
            .collect(),
    };
    let config = ServerConfig::new(group);
    assert!(config.validate().is_ok());
    (Coordinator::new(config), TestGroup { keypairs })
}

async fn login(coordinator: &mut Coordinator, group: &TestGroup, id: u16) -> LoginResponse {
    let fingerprint = coordinator.config().group.fingerprint();
    let challenge = coordinator
        .login(fingerprint, participant(id), PROTOCOL_VERSION)
        .await
        .expect("challenge");
    let signed = Signed::sign(challenge.challenge, group.keypair(id)).expect("sign challenge");
    coordinator
        .respond_to_challenge(signed)
        .await
        .expect("login")
}

/// Drain everything currently queued on a session stream.
fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn dkg_details(name: &str, threshold: u16, group: &TestGroup, creator: u16) -> Signed<NewDkgDetails> {
    Signed::sign(
        NewDkgDetails {
            name: name.to_string(),
            description: format!("{threshold}-of-{GROUP_SIZE} {name}"),
            threshold,
            expiry: Expiry::from_ttl(Duration::from_secs(3600)),
        },
        group.keypair(creator),
    )
    .expect("sign details")
}

fn dkg_commitment(id: u16, threshold: u16) -> DkgCommitment {
    let identifier = frost::Identifier::try_from(id).expect("identifier");
    let (_, package) =
        frost::keys::dkg::part1(identifier, GROUP_SIZE, threshold, &mut OsRng).expect("part1");
    package
}

/// Dealer-generated key material for signing flows: per-participant key
/// packages plus the aggregate key info handed to the server.
fn dealer_key(threshold: u16) -> (BTreeMap<u16, frost::keys::KeyPackage>, AggregateKeyInfo) {
    let (shares, pubkeys) = frost::keys::generate_with_dealer(
        GROUP_SIZE,
        threshold,
        frost::keys::IdentifierList::Default,
        &mut OsRng,
    )
    .expect("dealer");
    let mut key_packages = BTreeMap::new();
    for i in 1..=GROUP_SIZE {
        let identifier = frost::Identifier::try_from(i).expect("identifier");
        let share = shares[&identifier].clone();
        key_packages.insert(i, frost::keys::KeyPackage::try_from(share).expect("package"));
    }
    let info =
        AggregateKeyInfo::from_public_key_package(&pubkeys, threshold, [7u8; 32]).expect("info");
    (key_packages, info)
}

fn sig_request_details(info: &AggregateKeyInfo, message: &[u8]) -> SignaturesRequestDetails {
    SignaturesRequestDetails {
        required_sigs: vec![SingleSignatureDetails {
            sign_details: SignDetails {
                message: message.to_vec(),
                sighash_type: 0,
            },
            group_key: info.group_key.clone(),
            hd_derivation: Vec::new(),
        }],
        expiry: Expiry::from_ttl(Duration::from_secs(3600)),
    }
}

fn commit(key_package: &frost::keys::KeyPackage) -> (frost::round1::SigningNonces, SigningCommitment)
{
    frost::round1::commit(key_package.signing_share(), &mut OsRng)
}

fn sign_share(
    key_package: &frost::keys::KeyPackage,
    nonces: &frost::round1::SigningNonces,
    commitments: &SigningCommitmentSet,
    message: &[u8],
) -> frost::round2::SignatureShare {
    let signing_package = frost::SigningPackage::new(commitments.frost_map(), message);
    frost::round2::sign(&signing_package, nonces, key_package).expect("sign")
}

// =============================================================================
// Login and sessions
// =============================================================================

#[tokio::test]
async fn test_login_validation() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let fingerprint = coordinator.config().group.fingerprint();

    assert_matches!(
        coordinator.login(fingerprint, participant(1), 2).await,
        Err(InvalidRequest::InvalidProtoVersion(2))
    );
    assert_matches!(
        coordinator
            .login([0u8; 32], participant(1), PROTOCOL_VERSION)
            .await,
        Err(InvalidRequest::GroupMismatch)
    );
    assert_matches!(
        coordinator
            .login(fingerprint, participant(11), PROTOCOL_VERSION)
            .await,
        Err(InvalidRequest::NoParticipant)
    );

    // A challenge signed by the wrong key is rejected and stays pending.
    let challenge = coordinator
        .login(fingerprint, participant(1), PROTOCOL_VERSION)
        .await
        .expect("challenge");
    let forged = Signed::sign(challenge.challenge, group.keypair(2)).expect("sign");
    assert_matches!(
        coordinator.respond_to_challenge(forged).await,
        Err(InvalidRequest::InvalidChallengeSig)
    );
    let honest = Signed::sign(challenge.challenge, group.keypair(1)).expect("sign");
    assert!(coordinator.respond_to_challenge(honest).await.is_ok());

    // A consumed challenge does not work twice.
    let replay = Signed::sign(challenge.challenge, group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator.respond_to_challenge(replay).await,
        Err(InvalidRequest::NoChallenge)
    );

    // Responses must reference a known challenge.
    let unknown = Signed::sign(
        AuthChallenge {
            nonce: uuid::Uuid::new_v4(),
        },
        group.keypair(1),
    )
    .expect("sign");
    assert_matches!(
        coordinator.respond_to_challenge(unknown).await,
        Err(InvalidRequest::NoChallenge)
    );
}

#[tokio::test]
async fn test_relogin_evicts_and_peers_see_logout_before_login() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let first = login(&mut coordinator, &group, 1).await;
    let mut observer = login(&mut coordinator, &group, 2).await;
    drain(&mut observer.events);

    let second = login(&mut coordinator, &group, 1).await;
    assert_ne!(first.session_id, second.session_id);

    // The old session is gone.
    assert_matches!(
        coordinator.extend_session(first.session_id).await,
        Err(InvalidRequest::NoSession)
    );
    assert!(coordinator.extend_session(second.session_id).await.is_ok());

    let seen = drain(&mut observer.events);
    let status: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ServerEvent::ParticipantStatus { id, logged_in } if *id == participant(1) => {
                Some(*logged_in)
            }
            _ => None,
        })
        .collect();
    assert_eq!(status, vec![false, true]);
}

#[tokio::test]
async fn test_snapshot_reports_online_participants() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let _one = login(&mut coordinator, &group, 1).await;
    let _two = login(&mut coordinator, &group, 2).await;
    let three = login(&mut coordinator, &group, 3).await;

    assert_eq!(
        three.online_participants,
        [participant(1), participant(2)].into_iter().collect()
    );
    assert_eq!(coordinator.stats().live_sessions, 3);
}

#[tokio::test]
async fn test_subscribe_events_requires_known_session() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    assert_matches!(
        coordinator.subscribe_events(uuid::Uuid::new_v4()).await,
        Err(InvalidRequest::NoSession)
    );

    // Re-attaching replaces the stream; later events land on the new one.
    let session = login(&mut coordinator, &group, 1).await;
    drop(session.events);
    let mut events = coordinator
        .subscribe_events(session.session_id)
        .await
        .expect("resubscribe");
    let _ = login(&mut coordinator, &group, 2).await;
    let seen = drain(&mut events);
    assert!(seen.contains(&ServerEvent::ParticipantStatus {
        id: participant(2),
        logged_in: true,
    }));
}

#[tokio::test]
async fn test_logout_runs_end_session_side_effects() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let departing = login(&mut coordinator, &group, 1).await;
    let mut observer = login(&mut coordinator, &group, 2).await;
    drain(&mut observer.events);

    coordinator.logout(departing.session_id).await.expect("logout");
    assert_matches!(
        coordinator.logout(departing.session_id).await,
        Err(InvalidRequest::NoSession)
    );
    assert!(drain(&mut observer.events).contains(&ServerEvent::ParticipantStatus {
        id: participant(1),
        logged_in: false,
    }));
}

// =============================================================================
// DKG
// =============================================================================

#[tokio::test]
async fn test_dkg_request_validation() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let session = login(&mut coordinator, &group, 1).await;

    // Threshold n is legal, n + 1 is not.
    let details = dkg_details("all-of-us", GROUP_SIZE, &group, 1);
    assert!(coordinator
        .request_new_dkg(session.session_id, details, dkg_commitment(1, GROUP_SIZE))
        .await
        .is_ok());
    let details = dkg_details("too-many", GROUP_SIZE + 1, &group, 1);
    assert_matches!(
        coordinator
            .request_new_dkg(session.session_id, details, dkg_commitment(1, GROUP_SIZE))
            .await,
        Err(InvalidRequest::InvalidThreshold {
            threshold: 11,
            group_size: 10
        })
    );

    // Expiry must fall within the configured window.
    let mut sooner = NewDkgDetails {
        name: "too-soon".to_string(),
        description: String::new(),
        threshold: 2,
        expiry: Expiry::from_ttl(Duration::from_secs(60)),
    };
    let signed = Signed::sign(sooner.clone(), group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator
            .request_new_dkg(session.session_id, signed, dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::ExpiryTooSoon)
    );
    sooner.name = "too-late".to_string();
    sooner.expiry = Expiry::from_ttl(Duration::from_secs(8 * 24 * 3600));
    let signed = Signed::sign(sooner, group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator
            .request_new_dkg(session.session_id, signed, dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::ExpiryTooLate)
    );

    // Names are unique while the DKG lives.
    let details = dkg_details("all-of-us", 2, &group, 1);
    assert_matches!(
        coordinator
            .request_new_dkg(session.session_id, details, dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::DkgRequestExists)
    );

    // The details must be signed by the caller.
    let details = dkg_details("forged", 2, &group, 2);
    assert_matches!(
        coordinator
            .request_new_dkg(session.session_id, details, dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::InvalidDkgReqSig)
    );

    // Session required throughout.
    let details = dkg_details("no-session", 2, &group, 1);
    assert_matches!(
        coordinator
            .request_new_dkg(uuid::Uuid::new_v4(), details, dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::NoSession)
    );
}

/// The happy path: ten participants, a 2-of-10 DKG named "k", both rounds,
/// and the server forgetting the DKG once the last round-2 secrets are routed.
#[tokio::test]
async fn test_full_dkg_flow() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let mut sessions = BTreeMap::new();
    for i in 1..=GROUP_SIZE {
        sessions.insert(i, login(&mut coordinator, &group, i).await);
    }

    let details = dkg_details("k", 2, &group, 1);
    let mut commitments: Vec<(u16, DkgCommitment)> = vec![(1, dkg_commitment(1, 2))];
    coordinator
        .request_new_dkg(
            sessions[&1].session_id,
            details.clone(),
            commitments[0].1.clone(),
        )
        .await
        .expect("request dkg");

    // Everyone else sees the new DKG and commits in turn.
    assert!(drain(&mut sessions.get_mut(&2).expect("session").events)
        .iter()
        .any(|event| matches!(event, ServerEvent::NewDkg { creator, .. } if *creator == participant(1))));
    for i in 2..=GROUP_SIZE {
        let commitment = dkg_commitment(i, 2);
        commitments.push((i, commitment.clone()));
        coordinator
            .submit_dkg_commitment(sessions[&i].session_id, "k", commitment)
            .await
            .expect("commit");
    }

    // A late commitment is a duplicate, and round 1 is over.
    assert_matches!(
        coordinator
            .submit_dkg_commitment(sessions[&1].session_id, "k", dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::DkgCommitmentExists | InvalidRequest::NotRound1Dkg)
    );

    // Round 2: every participant signs the full commitment set and posts one
    // encrypted secret per peer.
    let expected_hash =
        hash_with_commitments(&details.obj, commitments.iter().map(|(id, c)| (*id, c)))
            .expect("hash");
    for i in 1..=GROUP_SIZE {
        use ed25519_dalek::Signer;
        let signature = group.keypair(i).sign(&expected_hash);
        let secrets: BTreeMap<ParticipantId, DkgEncryptedSecret> = (1..=GROUP_SIZE)
            .filter(|peer| *peer != i)
            .map(|peer| (participant(peer), DkgEncryptedSecret(vec![i as u8, peer as u8])))
            .collect();
        coordinator
            .submit_dkg_round2(sessions[&i].session_id, "k", signature, secrets)
            .await
            .expect("round 2");
    }

    // Each participant received one round-2 share from every peer.
    for i in 1..=GROUP_SIZE {
        let shares: Vec<_> = drain(&mut sessions.get_mut(&i).expect("session").events)
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::DkgRound2Share { .. }))
            .collect();
        assert_eq!(shares.len(), (GROUP_SIZE - 1) as usize, "participant {i}");
    }

    // The server never retains key material: the DKG is gone.
    assert_eq!(coordinator.stats().active_dkgs, 0);
    assert_matches!(
        coordinator
            .submit_dkg_commitment(sessions[&1].session_id, "k", dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::NoDkg)
    );
}

/// A logout during round 2 invalidates the commitment set; the DKG restarts
/// from an empty round 1 and completes after everyone re-commits.
#[tokio::test]
async fn test_logout_mid_round2_restarts_commitment_collection() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let mut sessions = BTreeMap::new();
    for i in 1..=GROUP_SIZE {
        sessions.insert(i, login(&mut coordinator, &group, i).await);
    }

    let details = dkg_details("replay", 2, &group, 1);
    coordinator
        .request_new_dkg(sessions[&1].session_id, details, dkg_commitment(1, 2))
        .await
        .expect("request");
    for i in 2..=GROUP_SIZE {
        coordinator
            .submit_dkg_commitment(sessions[&i].session_id, "replay", dkg_commitment(i, 2))
            .await
            .expect("commit");
    }
    // Round 1 is closed.
    assert_matches!(
        coordinator
            .submit_dkg_commitment(sessions[&1].session_id, "replay", dkg_commitment(1, 2))
            .await,
        Err(InvalidRequest::NotRound1Dkg | InvalidRequest::DkgCommitmentExists)
    );

    // The creator drops out mid-round-2 and returns: its login snapshot shows
    // the DKG back in round 1 with no commitments.
    coordinator
        .logout(sessions[&1].session_id)
        .await
        .expect("logout");
    let creator = login(&mut coordinator, &group, 1).await;
    assert_eq!(creator.new_dkgs.len(), 1);
    assert_eq!(creator.new_dkgs[0].details.obj.name, "replay");
    assert!(creator.new_dkgs[0].commitments.is_empty());
    sessions.insert(1, creator);

    // Everyone re-commits and the DKG advances again.
    for i in 1..=GROUP_SIZE {
        coordinator
            .submit_dkg_commitment(sessions[&i].session_id, "replay", dkg_commitment(i, 2))
            .await
            .expect("recommit");
    }
    assert_matches!(
        coordinator
            .submit_dkg_commitment(sessions[&2].session_id, "replay", dkg_commitment(2, 2))
            .await,
        Err(InvalidRequest::NotRound1Dkg)
    );
}

#[tokio::test]
async fn test_reject_dkg_is_idempotent_and_broadcast() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let mut one = login(&mut coordinator, &group, 1).await;
    let mut two = login(&mut coordinator, &group, 2).await;
    drain(&mut one.events);
    drain(&mut two.events);

    let details = dkg_details("doomed", 2, &group, 1);
    coordinator
        .request_new_dkg(one.session_id, details, dkg_commitment(1, 2))
        .await
        .expect("request");

    coordinator
        .reject_dkg(two.session_id, "doomed")
        .await
        .expect("reject");
    assert_eq!(coordinator.stats().active_dkgs, 0);

    // Rejecting again, or rejecting something unknown, is a silent no-op.
    coordinator
        .reject_dkg(two.session_id, "doomed")
        .await
        .expect("reject again");
    coordinator
        .reject_dkg(two.session_id, "never-existed")
        .await
        .expect("reject unknown");

    // The creator heard about the rejection; the rejector did not.
    assert!(drain(&mut one.events)
        .iter()
        .any(|event| matches!(event, ServerEvent::DkgReject { name, participant: p }
            if name == "doomed" && *p == participant(2))));
    assert!(!drain(&mut two.events)
        .iter()
        .any(|event| matches!(event, ServerEvent::DkgReject { .. })));
}

// =============================================================================
// DKG acknowledgements
// =============================================================================

#[tokio::test]
async fn test_ack_cache_upgrade_and_fanout() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let one = login(&mut coordinator, &group, 1).await;
    let mut two = login(&mut coordinator, &group, 2).await;
    let mut three = login(&mut coordinator, &group, 3).await;
    drain(&mut two.events);
    drain(&mut three.events);

    let group_key = GroupKey(vec![3u8; 33]);
    let nack = SignedDkgAck {
        signer: participant(2),
        signed: Signed::sign(
            DkgAck {
                group_key: group_key.clone(),
                accepted: false,
            },
            group.keypair(2),
        )
        .expect("sign"),
    };
    let ack = SignedDkgAck {
        signer: participant(2),
        signed: Signed::sign(
            DkgAck {
                group_key: group_key.clone(),
                accepted: true,
            },
            group.keypair(2),
        )
        .expect("sign"),
    };

    // false then true: the upgrade is cached and fanned out.
    coordinator
        .send_dkg_acks(one.session_id, vec![nack.clone()])
        .await
        .expect("send nack");
    coordinator
        .send_dkg_acks(one.session_id, vec![ack.clone()])
        .await
        .expect("send ack");

    let deliveries: Vec<bool> = drain(&mut three.events)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::DkgAcks { acks } => Some(acks[0].signed.obj.accepted),
            _ => None,
        })
        .collect();
    assert_eq!(deliveries, vec![false, true]);

    // A later false never downgrades, and nothing new is fanned out.
    coordinator
        .send_dkg_acks(one.session_id, vec![nack])
        .await
        .expect("send stale nack");
    assert!(drain(&mut three.events).is_empty());

    let have = coordinator
        .request_dkg_acks(
            three.session_id,
            vec![DkgAckRequest {
                ids: [participant(2)].into_iter().collect(),
                group_key: group_key.clone(),
            }],
        )
        .await
        .expect("request acks");
    assert_eq!(have.len(), 1);
    assert!(have[0].signed.obj.accepted);

    // The signer of a cached ack does not get its own ack fanned back.
    assert!(!drain(&mut two.events)
        .iter()
        .any(|event| matches!(event, ServerEvent::DkgAcks { .. })));
}

#[tokio::test]
async fn test_request_acks_validation_and_missing_fanout() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let one = login(&mut coordinator, &group, 1).await;
    let mut two = login(&mut coordinator, &group, 2).await;
    drain(&mut two.events);

    let group_key = GroupKey(vec![4u8; 33]);
    assert_matches!(
        coordinator
            .request_dkg_acks(
                one.session_id,
                vec![DkgAckRequest {
                    ids: [participant(1)].into_iter().collect(),
                    group_key: group_key.clone(),
                }],
            )
            .await,
        Err(InvalidRequest::CannotRequestSelfAck)
    );
    assert_matches!(
        coordinator
            .request_dkg_acks(
                one.session_id,
                vec![DkgAckRequest {
                    ids: [participant(11)].into_iter().collect(),
                    group_key: group_key.clone(),
                }],
            )
            .await,
        Err(InvalidRequest::NoParticipant)
    );

    // Nothing cached: the want-list goes out to the other sessions.
    let have = coordinator
        .request_dkg_acks(
            one.session_id,
            vec![DkgAckRequest {
                ids: [participant(2), participant(3)].into_iter().collect(),
                group_key: group_key.clone(),
            }],
        )
        .await
        .expect("request");
    assert!(have.is_empty());
    assert!(drain(&mut two.events).iter().any(|event| matches!(
        event,
        ServerEvent::DkgAckRequest { requests } if requests[0].ids.len() == 2
    )));

    // A bad signature fails the whole send.
    let forged = SignedDkgAck {
        signer: participant(3),
        signed: Signed::sign(
            DkgAck {
                group_key,
                accepted: true,
            },
            group.keypair(2),
        )
        .expect("sign"),
    };
    assert_matches!(
        coordinator.send_dkg_acks(one.session_id, vec![forged]).await,
        Err(InvalidRequest::InvalidDkgAckSig)
    );
}

// =============================================================================
// ROAST signature coordination
// =============================================================================

struct SigningFixture {
    coordinator: Coordinator,
    group: TestGroup,
    sessions: BTreeMap<u16, LoginResponse>,
    key_packages: BTreeMap<u16, frost::keys::KeyPackage>,
    info: AggregateKeyInfo,
    message: Vec<u8>,
    request_id: RequestId,
    creator_nonces: frost::round1::SigningNonces,
}

/// Log everyone in and open a signatures request from participant 1.
async fn signing_fixture(threshold: u16, message: &[u8]) -> SigningFixture {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let mut sessions = BTreeMap::new();
    for i in 1..=GROUP_SIZE {
        sessions.insert(i, login(&mut coordinator, &group, i).await);
    }
    let (key_packages, info) = dealer_key(threshold);
    let details = sig_request_details(&info, message);
    let signed = Signed::sign(details, group.keypair(1)).expect("sign");
    let (creator_nonces, creator_commitment) = commit(&key_packages[&1]);
    let request_id = coordinator
        .request_signatures(
            sessions[&1].session_id,
            vec![info.clone()],
            signed,
            vec![creator_commitment],
        )
        .await
        .expect("request signatures");
    SigningFixture {
        coordinator,
        group,
        sessions,
        key_packages,
        info,
        message: message.to_vec(),
        request_id,
        creator_nonces,
    }
}

#[tokio::test]
async fn test_signatures_request_validation() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let session = login(&mut coordinator, &group, 1).await;
    let (key_packages, info) = dealer_key(2);
    let (_, commitment) = commit(&key_packages[&1]);

    // Commitment count must match the wanted signatures.
    let details = sig_request_details(&info, b"payment");
    let signed = Signed::sign(details, group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator
            .request_signatures(session.session_id, vec![info.clone()], signed.clone(), vec![])
            .await,
        Err(InvalidRequest::WrongCommitmentNum)
    );

    // Key infos must cover exactly the wanted group keys.
    let (_, other_info) = dealer_key(2);
    assert_matches!(
        coordinator
            .request_signatures(
                session.session_id,
                vec![other_info],
                signed.clone(),
                vec![commitment.clone()],
            )
            .await,
        Err(InvalidRequest::WrongSigKeys)
    );

    // Expiry window is enforced.
    let mut short = sig_request_details(&info, b"payment");
    short.expiry = Expiry::from_ttl(Duration::from_secs(5));
    let short = Signed::sign(short, group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator
            .request_signatures(
                session.session_id,
                vec![info.clone()],
                short,
                vec![commitment.clone()],
            )
            .await,
        Err(InvalidRequest::ExpiryTooSoon)
    );
    let mut long = sig_request_details(&info, b"payment");
    long.expiry = Expiry::from_ttl(Duration::from_secs(15 * 24 * 3600));
    let long = Signed::sign(long, group.keypair(1)).expect("sign");
    assert_matches!(
        coordinator
            .request_signatures(
                session.session_id,
                vec![info.clone()],
                long,
                vec![commitment.clone()],
            )
            .await,
        Err(InvalidRequest::ExpiryTooLate)
    );

    // Details must be signed by the caller, and ids are unique.
    let forged = Signed::sign(sig_request_details(&info, b"payment"), group.keypair(2))
        .expect("sign");
    assert_matches!(
        coordinator
            .request_signatures(
                session.session_id,
                vec![info.clone()],
                forged,
                vec![commitment.clone()],
            )
            .await,
        Err(InvalidRequest::InvalidSigReqSig)
    );
    coordinator
        .request_signatures(
            session.session_id,
            vec![info.clone()],
            signed.clone(),
            vec![commitment.clone()],
        )
        .await
        .expect("request");
    assert_matches!(
        coordinator
            .request_signatures(session.session_id, vec![info], signed, vec![commitment])
            .await,
        Err(InvalidRequest::SigRequestExists)
    );
}

/// ROAST progress against rejectors: four decline, two honest signers open a
/// round and finish the signature, and everyone learns the outcome.
#[tokio::test]
async fn test_roast_completes_against_rejectors() {
    let mut fixture = signing_fixture(2, b"roast payment").await;
    let request_id = fixture.request_id;

    // Peers learn about the request.
    assert!(drain(&mut fixture.sessions.get_mut(&6).expect("session").events)
        .iter()
        .any(|event| matches!(event, ServerEvent::SignaturesRequest { request_id: id, .. } if *id == request_id)));

    // id2..id5 want no part of it; the pool stays viable (6 >= 2).
    for i in 2..=5 {
        fixture
            .coordinator
            .reject_signatures_request(fixture.sessions[&i].session_id, request_id)
            .await
            .expect("reject");
    }

    // id6 replies with a commitment only; that completes the first commitment
    // set {id1, id6} and opens a round.
    let (id6_nonces, id6_commitment) = commit(&fixture.key_packages[&6]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&6].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id6_commitment,
                share: None,
            }],
        )
        .await
        .expect("reply");
    let SignaturesResponse::NewRounds(rounds) = response else {
        panic!("expected new rounds for id6");
    };
    assert_eq!(rounds.len(), 1);
    let round_commitments = rounds[0].commitments.clone();
    assert_eq!(round_commitments.len(), 2);

    // id1 is told the same round opened over its live stream.
    let id1_rounds: Vec<_> = drain(&mut fixture.sessions.get_mut(&1).expect("session").events)
        .into_iter()
        .filter_map(|event| match event {
            ServerEvent::SignatureNewRounds { rounds, .. } => Some(rounds),
            _ => None,
        })
        .collect();
    assert_eq!(id1_rounds.len(), 1);
    assert_eq!(id1_rounds[0][0].commitments, round_commitments);

    // Both round members deliver their shares with fresh pipelined
    // commitments. The first share is not enough.
    let id1_share = sign_share(
        &fixture.key_packages[&1],
        &fixture.creator_nonces,
        &round_commitments,
        &fixture.message,
    );
    let (_, id1_next) = commit(&fixture.key_packages[&1]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&1].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id1_next,
                share: Some(id1_share),
            }],
        )
        .await
        .expect("id1 share");
    assert_matches!(response, SignaturesResponse::Pending);

    let id6_share = sign_share(
        &fixture.key_packages[&6],
        &id6_nonces,
        &round_commitments,
        &fixture.message,
    );
    let (_, id6_next) = commit(&fixture.key_packages[&6]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&6].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id6_next,
                share: Some(id6_share),
            }],
        )
        .await
        .expect("id6 share");
    let SignaturesResponse::Complete(signatures) = response else {
        panic!("expected completion");
    };
    assert_eq!(signatures.len(), 1);

    // The aggregate verifies under the group key.
    let verifying_key =
        frost::VerifyingKey::deserialize(&fixture.info.group_key.0).expect("group key");
    assert!(verifying_key.verify(&fixture.message, &signatures[0]).is_ok());

    // Everyone else (rejectors included) hears about completion, and the
    // batch is retained for late pickup.
    assert!(drain(&mut fixture.sessions.get_mut(&2).expect("session").events)
        .iter()
        .any(|event| matches!(event, ServerEvent::SignaturesComplete { request_id: id, .. } if *id == request_id)));
    assert_eq!(fixture.coordinator.stats().completed_sigs, 1);
    assert_eq!(fixture.coordinator.stats().active_sig_requests, 0);

    // A fresh login that never acknowledged the batch sees it in the snapshot.
    let relogin = login(&mut fixture.coordinator, &fixture.group, 9).await;
    assert_eq!(relogin.completed_sigs.len(), 1);
    assert_eq!(relogin.completed_sigs[0].request_id, request_id);

    // Late replies race benignly with completion.
    let (_, late_commitment) = commit(&fixture.key_packages[&7]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&7].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: late_commitment,
                share: None,
            }],
        )
        .await
        .expect("late reply");
    assert_matches!(response, SignaturesResponse::Pending);

    // So do late rejections.
    fixture
        .coordinator
        .reject_signatures_request(fixture.sessions[&8].session_id, request_id)
        .await
        .expect("late reject");
}

/// Forced failure: with a 3-of-10 request, eight provably-bad responders
/// leave a pool of two, and the request aborts for everyone.
#[tokio::test]
async fn test_roast_forced_failure_on_malicious_pool() {
    let mut fixture = signing_fixture(3, b"doomed payment").await;
    let request_id = fixture.request_id;

    for i in 2..=9 {
        let result = fixture
            .coordinator
            .submit_signature_replies(fixture.sessions[&i].session_id, request_id, vec![])
            .await;
        assert_matches!(result, Err(InvalidRequest::EmptySigReply));
    }

    // 10 - 8 = 2 < 3: aborted and deleted.
    assert_eq!(fixture.coordinator.stats().active_sig_requests, 0);
    assert!(drain(&mut fixture.sessions.get_mut(&1).expect("session").events)
        .iter()
        .any(|event| matches!(event, ServerEvent::SignaturesFailure { request_id: id } if *id == request_id)));

    // Further replies see nothing to act on.
    let (_, commitment) = commit(&fixture.key_packages[&10]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&10].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: commitment,
                share: None,
            }],
        )
        .await
        .expect("reply after failure");
    assert_matches!(response, SignaturesResponse::Pending);
}

#[tokio::test]
async fn test_malicious_marking_is_permanent_and_detected() {
    let mut fixture = signing_fixture(2, b"guarded payment").await;
    let request_id = fixture.request_id;

    // Duplicate sig indexes are misbehaviour.
    let (_, c_first) = commit(&fixture.key_packages[&2]);
    let (_, c_second) = commit(&fixture.key_packages[&2]);
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&2].session_id,
            request_id,
            vec![
                SignatureReply {
                    sig_index: 0,
                    next_commitment: c_first,
                    share: None,
                },
                SignatureReply {
                    sig_index: 0,
                    next_commitment: c_second,
                    share: None,
                },
            ],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::DuplicateSigReply));

    // Once malicious, always malicious.
    let (_, retry) = commit(&fixture.key_packages[&2]);
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&2].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: retry,
                share: None,
            }],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::MarkedMalicious));
    fixture
        .coordinator
        .reject_signatures_request(fixture.sessions[&2].session_id, request_id)
        .await
        .expect("reject is a no-op for the malicious");

    // Out-of-range indexes and unsolicited shares are misbehaviour too.
    let (_, id3_commitment) = commit(&fixture.key_packages[&3]);
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&3].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 7,
                next_commitment: id3_commitment,
                share: None,
            }],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::InvalidSigIndex));

    let (id4_nonces, id4_commitment) = commit(&fixture.key_packages[&4]);
    let unsolicited = {
        let mut commitments = BTreeMap::new();
        commitments.insert(participant(4), id4_commitment.clone());
        sign_share(
            &fixture.key_packages[&4],
            &id4_nonces,
            &SigningCommitmentSet { commitments },
            &fixture.message,
        )
    };
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&4].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id4_commitment,
                share: Some(unsolicited),
            }],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::UnsolicitedShare));
}

#[tokio::test]
async fn test_bad_share_is_rejected_and_round_survivors_continue() {
    let mut fixture = signing_fixture(2, b"resilient payment").await;
    let request_id = fixture.request_id;

    // id2's commitment opens the round {id1, id2}.
    let (_, id2_commitment) = commit(&fixture.key_packages[&2]);
    let response = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&2].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id2_commitment,
                share: None,
            }],
        )
        .await
        .expect("open round");
    let SignaturesResponse::NewRounds(rounds) = response else {
        panic!("expected new rounds");
    };
    let round_commitments = rounds[0].commitments.clone();

    // id2 owes a share now but replies without one: marked malicious.
    let (_, id2_next) = commit(&fixture.key_packages[&2]);
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&2].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id2_next,
                share: None,
            }],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::MissingShare));

    // id1 owes a share for the same round; a share computed with the wrong
    // nonces fails verification and is marked malicious as well.
    let (wrong_nonces, _) = commit(&fixture.key_packages[&1]);
    let bad_share = sign_share(
        &fixture.key_packages[&1],
        &wrong_nonces,
        &round_commitments,
        &fixture.message,
    );
    let (_, id1_next) = commit(&fixture.key_packages[&1]);
    let result = fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&1].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id1_next,
                share: Some(bad_share),
            }],
        )
        .await;
    assert_matches!(result, Err(InvalidRequest::InvalidShare));

    // The request is still alive for the rest of the pool (10 - 2 = 8 >= 2).
    assert_eq!(fixture.coordinator.stats().active_sig_requests, 1);
}

/// A participant owing a share finds the open round in its next login
/// snapshot.
#[tokio::test]
async fn test_login_snapshot_carries_owed_rounds() {
    let mut fixture = signing_fixture(2, b"sticky payment").await;
    let request_id = fixture.request_id;

    let (_, id2_commitment) = commit(&fixture.key_packages[&2]);
    fixture
        .coordinator
        .submit_signature_replies(
            fixture.sessions[&2].session_id,
            request_id,
            vec![SignatureReply {
                sig_index: 0,
                next_commitment: id2_commitment,
                share: None,
            }],
        )
        .await
        .expect("open round");

    // id1 owes a share; logging out and back in re-surfaces the round.
    fixture
        .coordinator
        .logout(fixture.sessions[&1].session_id)
        .await
        .expect("logout");
    let relogin = login(&mut fixture.coordinator, &fixture.group, 1).await;
    assert_eq!(relogin.sig_requests.len(), 1);
    assert_eq!(relogin.sig_requests[0].request_id, request_id);
    assert_eq!(relogin.sig_rounds.len(), 1);
    assert_eq!(relogin.sig_rounds[0].request_id, request_id);
    assert_eq!(relogin.sig_rounds[0].rounds[0].sig_index, 0);
    assert_eq!(relogin.sig_rounds[0].rounds[0].commitments.len(), 2);
}

// =============================================================================
// Recovery-share routing
// =============================================================================

#[tokio::test]
async fn test_recovery_share_fanout_and_dedup() {
    let (mut coordinator, group) = test_coordinator(GROUP_SIZE);
    let one = login(&mut coordinator, &group, 1).await;
    let mut two = login(&mut coordinator, &group, 2).await;
    // id3 stays offline.
    drain(&mut two.events);

    let group_key = GroupKey(vec![9u8; 33]);
    let shares: BTreeMap<ParticipantId, EncryptedKeyShare> = (2..=GROUP_SIZE)
        .map(|peer| (participant(peer), EncryptedKeyShare(vec![peer as u8; 48])))
        .collect();
    coordinator
        .share_secret_share(one.session_id, group_key.clone(), shares.clone())
        .await
        .expect("share");

    // Online receiver gets the event immediately.
    let received: Vec<_> = drain(&mut two.events)
        .into_iter()
        .filter(|event| matches!(event, ServerEvent::SecretShare { sender, .. } if *sender == participant(1)))
        .collect();
    assert_eq!(received.len(), 1);

    // A second post from the same sender is dropped silently everywhere.
    coordinator
        .share_secret_share(one.session_id, group_key.clone(), shares)
        .await
        .expect("repost");
    assert!(drain(&mut two.events).is_empty());

    // The offline receiver picks its single pending share up at login.
    let three = login(&mut coordinator, &group, 3).await;
    assert_eq!(three.secret_shares.len(), 1);
    assert_eq!(three.secret_shares[0].sender, participant(1));
    assert_eq!(three.secret_shares[0].group_key, group_key);

    // Validation: empty maps, self-addressed shares, and non-members.
    assert_matches!(
        coordinator
            .share_secret_share(one.session_id, group_key.clone(), BTreeMap::new())
            .await,
        Err(InvalidRequest::InvalidKeyShareMap)
    );
    let self_addressed: BTreeMap<ParticipantId, EncryptedKeyShare> =
        [(participant(1), EncryptedKeyShare(vec![1u8; 48]))]
            .into_iter()
            .collect();
    assert_matches!(
        coordinator
            .share_secret_share(one.session_id, group_key.clone(), self_addressed)
            .await,
        Err(InvalidRequest::InvalidKeyShareMap)
    );
    let outsider: BTreeMap<ParticipantId, EncryptedKeyShare> =
        [(participant(11), EncryptedKeyShare(vec![11u8; 48]))]
            .into_iter()
            .collect();
    assert_matches!(
        coordinator
            .share_secret_share(one.session_id, group_key, outsider)
            .await,
        Err(InvalidRequest::InvalidKeyShareMap)
    );
}

// =============================================================================
// Config round-trips through the wire forms
// =============================================================================

#[test]
fn test_config_round_trips_between_forms() {
    let keypairs: Vec<IdentityKeypair> = (0..3).map(|_| IdentityKeypair::generate(&mut OsRng)).collect();
    let group = GroupConfig {
        id: "round-trip".to_string(),
        participants: keypairs
            .iter()
            .enumerate()
            .map(|(i, keypair)| (participant(i as u16 + 1), keypair.verifying_key()))
            .collect(),
    };
    let mut config = ServerConfig::new(group);
    config.keep_alive_freq = Some(Duration::from_secs(20));
    config.session_ttl = Duration::from_secs(90);

    let binary = ServerConfig::from_bytes(&config.to_bytes().expect("bytes")).expect("binary");
    let text = ServerConfig::from_kv(&config.to_kv()).expect("text");
    assert_eq!(binary, config);
    assert_eq!(text, config);
    assert_eq!(binary.group.fingerprint(), text.group.fingerprint());
}
