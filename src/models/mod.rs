use std::collections::BTreeMap;

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PollError, PollResult};

const POLL_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const POLL_ID_LEN: usize = 6;

lazy_static! {
    static ref POLL_ID_RE: Regex = Regex::new(r"^[A-Z0-9]{6}$").unwrap();
    // User and nomination ids end up inside store paths, keep them to a safe charset
    static ref ENTITY_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap();
}

pub type Participants = BTreeMap<String, String>;
pub type Nominations = BTreeMap<String, Nomination>;
pub type Rankings = BTreeMap<String, Vec<String>>;
pub type Results = Vec<ResultEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: String,
    pub topic: String,
    pub votes_per_voter: u32,
    pub participants: Participants,
    pub admin_id: String,
    pub has_started: bool,
    pub nominations: Nominations,
    pub rankings: Rankings,
    pub results: Results,
    #[serde(default)]
    pub has_ended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nomination {
    pub user_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub nomination_id: String,
    pub nomination_text: String,
    pub score: f64,
}

/// Where a poll sits in its lifecycle, derived from the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Open,
    Voting,
    Closed,
}

impl Poll {
    pub fn new(id: String, topic: String, votes_per_voter: u32, admin_id: String, admin_name: String) -> Self {
        let mut participants = Participants::new();
        participants.insert(admin_id.clone(), admin_name);

        Self {
            id,
            topic,
            votes_per_voter,
            participants,
            admin_id,
            has_started: false,
            nominations: Nominations::new(),
            rankings: Rankings::new(),
            results: Results::new(),
            has_ended: false,
        }
    }

    pub fn phase(&self) -> PollPhase {
        if self.has_ended {
            PollPhase::Closed
        } else if self.has_started {
            PollPhase::Voting
        } else {
            PollPhase::Open
        }
    }
}

/// Identity carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub user_id: String,
    pub poll_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollFields {
    pub topic: String,
    pub votes_per_voter: u32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPollFields {
    pub poll_id: String,
    pub name: String,
}

/// Poll snapshot plus the token the caller uses for every later request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollWithToken {
    pub poll: Poll,
    pub access_token: String,
}

// --- Id generation ---

pub fn create_poll_id() -> String {
    let mut rng = rand::thread_rng();
    (0..POLL_ID_LEN)
        .map(|_| POLL_ID_ALPHABET[rng.gen_range(0..POLL_ID_ALPHABET.len())] as char)
        .collect()
}

pub fn create_user_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn create_nomination_id() -> String {
    // Short ids are enough inside one poll
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

// --- Input validation ---

pub fn normalize_poll_id(raw: &str) -> PollResult<String> {
    let poll_id = raw.trim().to_uppercase();
    if POLL_ID_RE.is_match(&poll_id) {
        Ok(poll_id)
    } else {
        Err(PollError::BadRequest(format!(
            "Poll id must be {} letters or digits",
            POLL_ID_LEN
        )))
    }
}

pub fn validate_entity_id(field: &str, id: &str) -> PollResult<()> {
    if ENTITY_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(PollError::BadRequest(format!("Invalid {}: {:?}", field, id)))
    }
}

/// Trims `value` and checks its character length falls in `min..=max`.
pub fn validate_text(field: &str, value: &str, min: usize, max: usize) -> PollResult<String> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len < min || len > max {
        return Err(PollError::BadRequest(format!(
            "{} must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(trimmed.to_string())
}
