//! Server configuration.
//!
//! All lifetimes the server enforces live here, together with the immutable
//! group description (participant identifiers mapped to long-term public
//! keys). A config round-trips identically through both its binary form and
//! its line-oriented `key = value` text form; TTL keys can additionally be
//! overridden from `ROAST_*` environment variables.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::coordination::types::ParticipantId;
use crate::crypto::IdentityPublicKey;

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: u16 = 1;

// Defaults
const DEFAULT_CHALLENGE_TTL_SECS: u64 = 20;
const DEFAULT_SESSION_TTL_SECS: u64 = 60;
const DEFAULT_MIN_DKG_REQUEST_TTL_SECS: u64 = 29 * 60;
const DEFAULT_MAX_DKG_REQUEST_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_MIN_SIGNATURES_REQUEST_TTL_SECS: u64 = 25;
const DEFAULT_MAX_SIGNATURES_REQUEST_TTL_SECS: u64 = 14 * 24 * 60 * 60;
const DEFAULT_MIN_COMPLETED_SIGNATURES_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_ACK_CACHE_TTL_SECS: u64 = 60;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Helper to read an env var as whole seconds.
fn env_secs(name: &str) -> Option<Duration> {
    env_trim(name).parse::<u64>().ok().map(Duration::from_secs)
}

/// The fixed group served by this coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Human-chosen group identity.
    pub id: String,
    /// Participant identifiers mapped to long-term public keys.
    pub participants: BTreeMap<ParticipantId, IdentityPublicKey>,
}

impl GroupConfig {
    /// Number of participants (`n`).
    pub fn size(&self) -> u16 {
        self.participants.len() as u16
    }

    pub fn contains(&self, participant: ParticipantId) -> bool {
        self.participants.contains_key(&participant)
    }

    pub fn public_key(&self, participant: ParticipantId) -> Option<&IdentityPublicKey> {
        self.participants.get(&participant)
    }

    /// Stable hash over the group identity and the ordered participant
    /// mapping; clients present this at login.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        for (id, key) in &self.participants {
            hasher.update(id.get().to_be_bytes());
            hasher.update(key.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Recognized server options and the group description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Time a login challenge remains valid.
    pub challenge_ttl: Duration,
    /// Baseline session expiry; refreshed by session extension.
    pub session_ttl: Duration,
    /// Lower bound on DKG request expiry.
    pub min_dkg_request_ttl: Duration,
    /// Upper bound on DKG request expiry.
    pub max_dkg_request_ttl: Duration,
    /// Lower bound on signatures request expiry.
    pub min_signatures_request_ttl: Duration,
    /// Upper bound on signatures request expiry.
    pub max_signatures_request_ttl: Duration,
    /// Minimum retention for completed signatures.
    pub min_completed_signatures_ttl: Duration,
    /// Retention for DKG acknowledgement cache entries.
    pub ack_cache_ttl: Duration,
    /// If set, emit keepalive events at this interval on each session.
    pub keep_alive_freq: Option<Duration>,
    /// The group this server coordinates.
    pub group: GroupConfig,
}

impl ServerConfig {
    /// Defaults for every TTL, serving the given group.
    pub fn new(group: GroupConfig) -> Self {
        Self {
            challenge_ttl: Duration::from_secs(DEFAULT_CHALLENGE_TTL_SECS),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            min_dkg_request_ttl: Duration::from_secs(DEFAULT_MIN_DKG_REQUEST_TTL_SECS),
            max_dkg_request_ttl: Duration::from_secs(DEFAULT_MAX_DKG_REQUEST_TTL_SECS),
            min_signatures_request_ttl: Duration::from_secs(
                DEFAULT_MIN_SIGNATURES_REQUEST_TTL_SECS,
            ),
            max_signatures_request_ttl: Duration::from_secs(
                DEFAULT_MAX_SIGNATURES_REQUEST_TTL_SECS,
            ),
            min_completed_signatures_ttl: Duration::from_secs(
                DEFAULT_MIN_COMPLETED_SIGNATURES_TTL_SECS,
            ),
            ack_cache_ttl: Duration::from_secs(DEFAULT_ACK_CACHE_TTL_SECS),
            keep_alive_freq: None,
            group,
        }
    }

    /// Defaults with any `ROAST_*_SECS` environment overrides applied.
    pub fn from_env(group: GroupConfig) -> Self {
        let mut config = Self::new(group);
        if let Some(ttl) = env_secs("ROAST_CHALLENGE_TTL_SECS") {
            config.challenge_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_SESSION_TTL_SECS") {
            config.session_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_MIN_DKG_REQUEST_TTL_SECS") {
            config.min_dkg_request_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_MAX_DKG_REQUEST_TTL_SECS") {
            config.max_dkg_request_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_MIN_SIGNATURES_REQUEST_TTL_SECS") {
            config.min_signatures_request_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_MAX_SIGNATURES_REQUEST_TTL_SECS") {
            config.max_signatures_request_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_MIN_COMPLETED_SIGNATURES_TTL_SECS") {
            config.min_completed_signatures_ttl = ttl;
        }
        if let Some(ttl) = env_secs("ROAST_ACK_CACHE_TTL_SECS") {
            config.ack_cache_ttl = ttl;
        }
        if let Some(freq) = env_secs("ROAST_KEEP_ALIVE_FREQ_SECS") {
            config.keep_alive_freq = Some(freq);
        }
        config
    }

    /// Validate settings before serving.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.group.participants.is_empty() {
            return Err("group must have at least one participant".to_string());
        }
        if self.min_dkg_request_ttl > self.max_dkg_request_ttl {
            return Err("min_dkg_request_ttl exceeds max_dkg_request_ttl".to_string());
        }
        if self.min_signatures_request_ttl > self.max_signatures_request_ttl {
            return Err(
                "min_signatures_request_ttl exceeds max_signatures_request_ttl".to_string(),
            );
        }
        Ok(())
    }

    // Binary form

    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| e.to_string())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }

    // Text (key/value) form

    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: String| {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&value);
            out.push('\n');
        };
        push("group_id", self.group.id.clone());
        push("challenge_ttl_secs", self.challenge_ttl.as_secs().to_string());
        push("session_ttl_secs", self.session_ttl.as_secs().to_string());
        push(
            "min_dkg_request_ttl_secs",
            self.min_dkg_request_ttl.as_secs().to_string(),
        );
        push(
            "max_dkg_request_ttl_secs",
            self.max_dkg_request_ttl.as_secs().to_string(),
        );
        push(
            "min_signatures_request_ttl_secs",
            self.min_signatures_request_ttl.as_secs().to_string(),
        );
        push(
            "max_signatures_request_ttl_secs",
            self.max_signatures_request_ttl.as_secs().to_string(),
        );
        push(
            "min_completed_signatures_ttl_secs",
            self.min_completed_signatures_ttl.as_secs().to_string(),
        );
        push(
            "ack_cache_ttl_secs",
            self.ack_cache_ttl.as_secs().to_string(),
        );
        if let Some(freq) = self.keep_alive_freq {
            push("keep_alive_freq_secs", freq.as_secs().to_string());
        }
        for (id, key) in &self.group.participants {
            push(&format!("participant.{id}"), hex::encode(key.as_bytes()));
        }
        out
    }

    pub fn from_kv(text: &str) -> Result<Self, String> {
        let mut group_id = None;
        let mut participants = BTreeMap::new();
        let mut fields: BTreeMap<&str, u64> = BTreeMap::new();
        let mut keep_alive_freq = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected 'key = value'", number + 1))?;
            let (key, value) = (key.trim(), value.trim());

            if key == "group_id" {
                group_id = Some(value.to_string());
            } else if let Some(id) = key.strip_prefix("participant.") {
                let id: u16 = id
                    .parse()
                    .map_err(|_| format!("line {}: bad participant id", number + 1))?;
                let id = ParticipantId::new(id)
                    .ok_or_else(|| format!("line {}: participant id cannot be 0", number + 1))?;
                let bytes = hex::decode(value)
                    .map_err(|_| format!("line {}: bad participant key hex", number + 1))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| format!("line {}: participant key must be 32 bytes", number + 1))?;
                let key = IdentityPublicKey::from_bytes(&bytes)
                    .map_err(|e| format!("line {}: {e}", number + 1))?;
                participants.insert(id, key);
            } else if key == "keep_alive_freq_secs" {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("line {}: bad duration", number + 1))?;
                keep_alive_freq = Some(Duration::from_secs(secs));
            } else {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("line {}: bad duration", number + 1))?;
                match key {
                    "challenge_ttl_secs"
                    | "session_ttl_secs"
                    | "min_dkg_request_ttl_secs"
                    | "max_dkg_request_ttl_secs"
                    | "min_signatures_request_ttl_secs"
                    | "max_signatures_request_ttl_secs"
                    | "min_completed_signatures_ttl_secs"
                    | "ack_cache_ttl_secs" => {
                        fields.insert(
                            match key {
                                "challenge_ttl_secs" => "challenge",
                                "session_ttl_secs" => "session",
                                "min_dkg_request_ttl_secs" => "min_dkg",
                                "max_dkg_request_ttl_secs" => "max_dkg",
                                "min_signatures_request_ttl_secs" => "min_sig",
                                "max_signatures_request_ttl_secs" => "max_sig",
                                "min_completed_signatures_ttl_secs" => "min_completed",
                                _ => "ack_cache",
                            },
                            secs,
                        );
                    }
                    other => return Err(format!("line {}: unknown key '{other}'", number + 1)),
                }
            }
        }

        let group = GroupConfig {
            id: group_id.ok_or_else(|| "missing group_id".to_string())?,
            participants,
        };
        let mut config = Self::new(group);
        let mut take = |name: &str, slot: &mut Duration| {
            if let Some(secs) = fields.get(name) {
                *slot = Duration::from_secs(*secs);
            }
        };
        take("challenge", &mut config.challenge_ttl);
        take("session", &mut config.session_ttl);
        take("min_dkg", &mut config.min_dkg_request_ttl);
        take("max_dkg", &mut config.max_dkg_request_ttl);
        take("min_sig", &mut config.min_signatures_request_ttl);
        take("max_sig", &mut config.max_signatures_request_ttl);
        take("min_completed", &mut config.min_completed_signatures_ttl);
        take("ack_cache", &mut config.ack_cache_ttl);
        config.keep_alive_freq = keep_alive_freq;
        Ok(config)
    }
}
