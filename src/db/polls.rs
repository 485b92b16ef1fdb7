use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde_json::{json, Value};

use super::{DocPath, DocumentStore};
use crate::error::{PollError, PollResult};
use crate::models::{Nomination, Poll, Results};

const KEY_PREFIX: &str = "polls:";

fn poll_key(poll_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, poll_id)
}

/// Translates poll operations into document store path operations.
///
/// Holds no rules: every mutation is a single store write followed by a fresh
/// read of the whole poll.
#[derive(Clone)]
pub struct PollRepository {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
}

impl PollRepository {
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Stores a fresh poll with the configured TTL. `Ok(None)` means the poll id
    /// is already taken by a live poll.
    pub async fn create(&self, poll: &Poll) -> PollResult<Option<Poll>> {
        let key = poll_key(&poll.id);
        info!("Creating new poll {} with TTL {:?}", poll.id, self.ttl);

        let document = serde_json::to_value(poll)
            .map_err(|e| PollError::StorageUnavailable(format!("Failed to encode poll {}: {}", poll.id, e)))?;

        let created = self.store.create(&key, &document, self.ttl).await.map_err(|e| {
            error!("Failed to add poll {}: {}", poll.id, e);
            PollError::from(e)
        })?;

        if created { Ok(Some(poll.clone())) } else { Ok(None) }
    }

    pub async fn get(&self, poll_id: &str) -> PollResult<Poll> {
        debug!("Attempt to get poll {}", poll_id);

        let document = self.store.get(&poll_key(poll_id)).await.map_err(|e| {
            error!("Failed to get poll {}: {}", poll_id, e);
            PollError::from(e)
        })?;

        let document = document.ok_or_else(|| PollError::NotFound(format!("Poll {} not found", poll_id)))?;

        serde_json::from_value(document)
            .map_err(|e| PollError::StorageUnavailable(format!("Stored poll {} is malformed: {}", poll_id, e)))
    }

    pub async fn add_participant(&self, poll_id: &str, user_id: &str, name: &str) -> PollResult<Poll> {
        info!("Attempt to add participant {}/{} to {}", user_id, name, poll_id);
        let path = DocPath::root().field("participants").field(user_id);
        self.set_and_reload(poll_id, &path, json!(name)).await
    }

    pub async fn remove_participant(&self, poll_id: &str, user_id: &str) -> PollResult<Poll> {
        info!("Attempt to remove participant {} from {}", user_id, poll_id);
        let path = DocPath::root().field("participants").field(user_id);
        self.delete_and_reload(poll_id, &path).await
    }

    pub async fn add_nomination(&self, poll_id: &str, nomination_id: &str, nomination: &Nomination) -> PollResult<Poll> {
        info!("Attempt to add nomination {}/{} to {}", nomination_id, nomination.text, poll_id);
        let path = DocPath::root().field("nominations").field(nomination_id);
        self.set_and_reload(poll_id, &path, to_json(nomination)?).await
    }

    pub async fn remove_nomination(&self, poll_id: &str, nomination_id: &str) -> PollResult<Poll> {
        info!("Attempt to remove nomination {} from {}", nomination_id, poll_id);
        let path = DocPath::root().field("nominations").field(nomination_id);
        self.delete_and_reload(poll_id, &path).await
    }

    pub async fn start(&self, poll_id: &str) -> PollResult<Poll> {
        info!("Starting poll {}", poll_id);
        let path = DocPath::root().field("hasStarted");
        self.set_and_reload(poll_id, &path, json!(true)).await
    }

    pub async fn add_rankings(&self, poll_id: &str, user_id: &str, rankings: &[String]) -> PollResult<Poll> {
        info!("Attempt to add rankings for {} to poll {}: {:?}", user_id, poll_id, rankings);
        let path = DocPath::root().field("rankings").field(user_id);
        self.set_and_reload(poll_id, &path, json!(rankings)).await
    }

    /// Stores the results and marks the poll ended in the same write.
    pub async fn add_results(&self, poll_id: &str, results: &Results) -> PollResult<Poll> {
        info!("Attempt to add {} result(s) to {}", results.len(), poll_id);
        let updates = [
            (DocPath::root().field("results"), to_json(results)?),
            (DocPath::root().field("hasEnded"), json!(true)),
        ];

        let written = self.store.set_paths(&poll_key(poll_id), &updates).await.map_err(|e| {
            error!("Failed to add results to poll {}: {}", poll_id, e);
            PollError::from(e)
        })?;

        if !written {
            return Err(PollError::NotFound(format!("Poll {} not found", poll_id)));
        }

        self.get(poll_id).await
    }

    pub async fn delete(&self, poll_id: &str) -> PollResult<()> {
        info!("Deleting poll {}", poll_id);

        let deleted = self.store.delete(&poll_key(poll_id)).await.map_err(|e| {
            error!("Failed to delete poll {}: {}", poll_id, e);
            PollError::from(e)
        })?;

        if deleted {
            Ok(())
        } else {
            Err(PollError::NotFound(format!("Poll {} not found", poll_id)))
        }
    }

    /// Removes expired polls from the store, returning their ids.
    pub async fn purge_expired(&self) -> PollResult<Vec<String>> {
        let keys = self.store.purge_expired().await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    async fn set_and_reload(&self, poll_id: &str, path: &DocPath, value: Value) -> PollResult<Poll> {
        let written = self.store.set_path(&poll_key(poll_id), path, &value).await.map_err(|e| {
            error!("Failed to set {} on poll {}: {}", path, poll_id, e);
            PollError::from(e)
        })?;

        if !written {
            return Err(PollError::NotFound(format!("Poll {} not found", poll_id)));
        }

        self.get(poll_id).await
    }

    async fn delete_and_reload(&self, poll_id: &str, path: &DocPath) -> PollResult<Poll> {
        let written = self.store.delete_path(&poll_key(poll_id), path).await.map_err(|e| {
            error!("Failed to delete {} on poll {}: {}", path, poll_id, e);
            PollError::from(e)
        })?;

        if !written {
            return Err(PollError::NotFound(format!("Poll {} not found", poll_id)));
        }

        self.get(poll_id).await
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> PollResult<Value> {
    serde_json::to_value(value).map_err(|e| PollError::StorageUnavailable(format!("Failed to encode value: {}", e)))
}
