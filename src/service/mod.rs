use std::collections::HashSet;

use log::{debug, info, warn};

use crate::auth::{ensure_admin, IdentityGate};
use crate::db::PollRepository;
use crate::error::{PollError, PollResult};
use crate::models::{
    create_nomination_id, create_poll_id, create_user_id, AuthPayload, CreatePollFields, JoinPollFields, Nomination,
    Poll, PollPhase, PollWithToken,
};
use crate::voting;

// How many fresh poll ids to try before giving up on a crowded keyspace
const MAX_POLL_ID_ATTEMPTS: usize = 5;

/// The poll state machine. Every rule about who may do what, and when, lives here.
///
/// Holds no poll state of its own: each call reads the current document from the
/// repository and every mutation returns the re-read snapshot.
#[derive(Clone)]
pub struct PollService {
    repository: PollRepository,
    gate: IdentityGate,
}

impl PollService {
    pub fn new(repository: PollRepository, gate: IdentityGate) -> Self {
        Self { repository, gate }
    }

    pub fn gate(&self) -> &IdentityGate {
        &self.gate
    }

    pub async fn create_poll(&self, fields: CreatePollFields) -> PollResult<PollWithToken> {
        let user_id = create_user_id();

        for _ in 0..MAX_POLL_ID_ATTEMPTS {
            let poll = Poll::new(
                create_poll_id(),
                fields.topic.clone(),
                fields.votes_per_voter,
                user_id.clone(),
                fields.name.clone(),
            );

            let Some(created) = self.repository.create(&poll).await? else {
                warn!("Poll id {} already in use, drawing another", poll.id);
                continue;
            };

            let access_token = self.gate.sign(&AuthPayload {
                user_id: user_id.clone(),
                poll_id: created.id.clone(),
                name: fields.name.clone(),
            })?;

            info!("Created poll {} for admin {}", created.id, user_id);
            return Ok(PollWithToken { poll: created, access_token });
        }

        Err(PollError::StorageUnavailable("Could not allocate a unique poll id".to_string()))
    }

    /// Issues an identity for an existing poll. The participant itself is added
    /// when the socket connects.
    pub async fn join_poll(&self, fields: JoinPollFields) -> PollResult<PollWithToken> {
        let user_id = create_user_id();
        debug!("Fetching poll {} for user {}", fields.poll_id, user_id);

        let poll = self.repository.get(&fields.poll_id).await?;

        let access_token = self.gate.sign(&AuthPayload {
            user_id,
            poll_id: poll.id.clone(),
            name: fields.name,
        })?;

        Ok(PollWithToken { poll, access_token })
    }

    pub async fn rejoin_poll(&self, identity: &AuthPayload) -> PollResult<Poll> {
        debug!("Rejoining poll {} for user {}:{}", identity.poll_id, identity.user_id, identity.name);
        self.add_participant(identity).await
    }

    pub async fn get_poll(&self, poll_id: &str) -> PollResult<Poll> {
        self.repository.get(poll_id).await
    }

    pub async fn add_participant(&self, identity: &AuthPayload) -> PollResult<Poll> {
        self.repository
            .add_participant(&identity.poll_id, &identity.user_id, &identity.name)
            .await
    }

    /// Removes `user_id` unless voting has begun. `Ok(None)` means nothing changed.
    pub async fn remove_participant(&self, poll_id: &str, user_id: &str) -> PollResult<Option<Poll>> {
        let poll = self.repository.get(poll_id).await?;

        if poll.has_started {
            debug!("Poll {} has started, keeping participant {}", poll_id, user_id);
            return Ok(None);
        }

        if user_id == poll.admin_id {
            return Err(PollError::InvalidState("The admin cannot be removed from the poll".to_string()));
        }

        self.repository.remove_participant(poll_id, user_id).await.map(Some)
    }

    /// Admin-only removal of another participant.
    pub async fn kick_participant(&self, caller: &AuthPayload, user_id: &str) -> PollResult<Option<Poll>> {
        self.admin_poll(caller).await?;
        self.remove_participant(&caller.poll_id, user_id).await
    }

    /// Disconnect effect. The admin's seat is never given up by a dropped connection.
    pub async fn leave_poll(&self, identity: &AuthPayload) -> PollResult<Option<Poll>> {
        let poll = self.repository.get(&identity.poll_id).await?;
        if poll.admin_id == identity.user_id {
            return Ok(None);
        }
        self.remove_participant(&identity.poll_id, &identity.user_id).await
    }

    pub async fn add_nomination(&self, caller: &AuthPayload, text: &str) -> PollResult<Poll> {
        let nomination = Nomination { user_id: caller.user_id.clone(), text: text.to_string() };
        self.repository
            .add_nomination(&caller.poll_id, &create_nomination_id(), &nomination)
            .await
    }

    pub async fn remove_nomination(&self, caller: &AuthPayload, nomination_id: &str) -> PollResult<Poll> {
        let poll = self.admin_poll(caller).await?;

        if poll.has_started {
            return Err(PollError::InvalidState("Nominations are locked once voting starts".to_string()));
        }

        self.repository.remove_nomination(&caller.poll_id, nomination_id).await
    }

    pub async fn start_poll(&self, caller: &AuthPayload) -> PollResult<Poll> {
        let poll = self.admin_poll(caller).await?;

        if poll.has_started {
            return Err(PollError::InvalidState("Poll has already started".to_string()));
        }

        self.repository.start(&caller.poll_id).await
    }

    /// Records the caller's ballot, replacing any earlier one.
    pub async fn submit_rankings(&self, caller: &AuthPayload, rankings: Vec<String>) -> PollResult<Poll> {
        let poll = self.repository.get(&caller.poll_id).await?;

        match poll.phase() {
            PollPhase::Open => return Err(PollError::InvalidState("Can't submit until start".to_string())),
            PollPhase::Closed => return Err(PollError::InvalidState("Poll is already closed".to_string())),
            PollPhase::Voting => {}
        }

        validate_ballot(&poll, &rankings)?;

        self.repository
            .add_rankings(&caller.poll_id, &caller.user_id, &rankings)
            .await
    }

    /// Scores the ballots and stores the results. Results are computed once.
    pub async fn close_poll(&self, caller: &AuthPayload) -> PollResult<Poll> {
        let poll = self.admin_poll(caller).await?;

        match poll.phase() {
            PollPhase::Open => return Err(PollError::InvalidState("Poll has not started".to_string())),
            PollPhase::Closed => return Err(PollError::InvalidState("Results were already computed".to_string())),
            PollPhase::Voting => {}
        }

        let results = voting::score(&poll.rankings, &poll.nominations, poll.votes_per_voter)?;
        info!("Computed {} result(s) for poll {}", results.len(), poll.id);

        self.repository.add_results(&caller.poll_id, &results).await
    }

    pub async fn cancel_poll(&self, caller: &AuthPayload) -> PollResult<()> {
        self.admin_poll(caller).await?;
        self.repository.delete(&caller.poll_id).await
    }

    /// Loads the caller's poll as stored right now and checks they administer it.
    async fn admin_poll(&self, caller: &AuthPayload) -> PollResult<Poll> {
        let poll = self.repository.get(&caller.poll_id).await?;
        ensure_admin(caller, &poll)?;
        Ok(poll)
    }
}

fn validate_ballot(poll: &Poll, rankings: &[String]) -> PollResult<()> {
    if rankings.is_empty() {
        return Err(PollError::BadRequest("Rankings must not be empty".to_string()));
    }

    if rankings.len() > poll.votes_per_voter as usize {
        return Err(PollError::BadRequest(format!(
            "At most {} nominations may be ranked",
            poll.votes_per_voter
        )));
    }

    let mut seen = HashSet::new();
    for nomination_id in rankings {
        if !seen.insert(nomination_id.as_str()) {
            return Err(PollError::BadRequest(format!("Nomination {} ranked twice", nomination_id)));
        }
        if !poll.nominations.contains_key(nomination_id) {
            return Err(PollError::InvalidReference(format!("Unknown nomination {}", nomination_id)));
        }
    }

    Ok(())
}
