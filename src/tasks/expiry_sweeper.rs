use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::time::interval;

use crate::commands::ServerEvent;
use crate::db::PollRepository;
use crate::rooms::RoomRegistry;

pub async fn sweep_expired_polls_task(repository: PollRepository, rooms: Arc<RoomRegistry>, every: Duration) {
    info!("Starting background task to sweep expired polls every {:?}", every);
    let mut interval = interval(every);

    loop {
        interval.tick().await; // Wait for the next interval tick
        sweep_once(&repository, &rooms).await;
    }
}

/// Purges expired polls and hangs up any sockets still attached to them.
pub async fn sweep_once(repository: &PollRepository, rooms: &RoomRegistry) -> usize {
    match repository.purge_expired().await {
        Ok(expired) => {
            for poll_id in &expired {
                let notified = rooms.broadcast(poll_id, ServerEvent::PollCanceled);
                rooms.close_room(poll_id);
                info!("Poll {} expired; notified {} connection(s)", poll_id, notified);
            }
            expired.len()
        }
        Err(e) => {
            error!("Failed to purge expired polls: {}", e);
            0
        }
    }
}
