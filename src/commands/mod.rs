use serde::{Deserialize, Serialize};

use crate::error::{PollError, PollResult};
use crate::models::{validate_entity_id, validate_text, Poll};

pub const MAX_NOMINATION_LEN: usize = 100;

/// Actions a connected client may send, one JSON frame each:
/// `{"event": "nominate", "data": {"text": "Tacos"}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientAction {
    RemoveParticipant { id: String },
    Nominate { text: String },
    RemoveNomination { id: String },
    StartVote,
    SubmitRankings { rankings: Vec<String> },
    ClosePoll,
    CancelPoll,
}

impl ClientAction {
    pub fn parse(frame: &str) -> PollResult<Self> {
        let action: ClientAction = serde_json::from_str(frame)
            .map_err(|e| PollError::BadRequest(format!("Unrecognised message: {}", e)))?;
        action.validated()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::RemoveParticipant { .. } => "remove_participant",
            ClientAction::Nominate { .. } => "nominate",
            ClientAction::RemoveNomination { .. } => "remove_nomination",
            ClientAction::StartVote => "start_vote",
            ClientAction::SubmitRankings { .. } => "submit_rankings",
            ClientAction::ClosePoll => "close_poll",
            ClientAction::CancelPoll => "cancel_poll",
        }
    }

    /// Checks the payload shape before any poll logic sees it.
    fn validated(self) -> PollResult<Self> {
        match self {
            ClientAction::RemoveParticipant { id } => {
                validate_entity_id("participant id", &id)?;
                Ok(ClientAction::RemoveParticipant { id })
            }
            ClientAction::RemoveNomination { id } => {
                validate_entity_id("nomination id", &id)?;
                Ok(ClientAction::RemoveNomination { id })
            }
            ClientAction::Nominate { text } => {
                let text = validate_text("Nomination", &text, 1, MAX_NOMINATION_LEN)?;
                Ok(ClientAction::Nominate { text })
            }
            ClientAction::SubmitRankings { rankings } => {
                for id in &rankings {
                    validate_entity_id("nomination id", id)?;
                }
                Ok(ClientAction::SubmitRankings { rankings })
            }
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    PollUpdated(Poll),
    PollCanceled,
    Exception(ExceptionBody),
}

impl From<&PollError> for ServerEvent {
    fn from(err: &PollError) -> Self {
        ServerEvent::Exception(ExceptionBody { kind: err.kind().to_string(), message: err.client_message() })
    }
}
