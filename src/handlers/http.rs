use axum::{extract::State, Json};
use log::debug;
use serde::Deserialize;

use super::Gateway;
use crate::commands::ServerEvent;
use crate::error::{PollError, PollResult};
use crate::models::{normalize_poll_id, validate_text, CreatePollFields, JoinPollFields, Poll, PollWithToken};

const MAX_TOPIC_LEN: usize = 100;
const MAX_NAME_LEN: usize = 25;
const MAX_VOTES_PER_VOTER: u32 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinBody {
    pub access_token: String,
}

/// `POST /polls`
pub async fn create_poll(
    State(gateway): State<Gateway>,
    Json(body): Json<CreatePollFields>,
) -> PollResult<Json<PollWithToken>> {
    if body.votes_per_voter == 0 || body.votes_per_voter > MAX_VOTES_PER_VOTER {
        return Err(PollError::BadRequest(format!(
            "votesPerVoter must be between 1 and {}",
            MAX_VOTES_PER_VOTER
        )));
    }

    let fields = CreatePollFields {
        topic: validate_text("Topic", &body.topic, 1, MAX_TOPIC_LEN)?,
        votes_per_voter: body.votes_per_voter,
        name: validate_text("Name", &body.name, 1, MAX_NAME_LEN)?,
    };

    Ok(Json(gateway.service().create_poll(fields).await?))
}

/// `POST /polls/join`
pub async fn join_poll(
    State(gateway): State<Gateway>,
    Json(body): Json<JoinPollFields>,
) -> PollResult<Json<PollWithToken>> {
    let fields = JoinPollFields {
        poll_id: normalize_poll_id(&body.poll_id)?,
        name: validate_text("Name", &body.name, 1, MAX_NAME_LEN)?,
    };

    Ok(Json(gateway.service().join_poll(fields).await?))
}

/// `POST /polls/rejoin`. The token travels in the body and gates only this call.
pub async fn rejoin_poll(State(gateway): State<Gateway>, Json(body): Json<RejoinBody>) -> PollResult<Json<Poll>> {
    let identity = gateway.service().gate().verify(&body.access_token)?;
    debug!("Rejoin request from user {} for poll {}", identity.user_id, identity.poll_id);

    let poll = gateway.service().rejoin_poll(&identity).await?;
    gateway.rooms().broadcast(&poll.id, ServerEvent::PollUpdated(poll.clone()));

    Ok(Json(poll))
}
