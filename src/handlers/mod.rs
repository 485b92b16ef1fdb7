pub mod http;
pub mod socket;

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::commands::{ClientAction, ServerEvent};
use crate::error::{PollError, PollResult};
use crate::models::{AuthPayload, Poll};
use crate::rooms::{ConnectionHandle, Outbound, RoomRegistry};
use crate::service::PollService;

/// One authenticated socket: who it is, where it sits, and how to reach it.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub identity: AuthPayload,
    token: String,
}

/// Glue between sockets, the poll service, and the room registry.
#[derive(Clone)]
pub struct Gateway {
    service: PollService,
    rooms: Arc<RoomRegistry>,
}

impl Gateway {
    pub fn new(service: PollService, rooms: Arc<RoomRegistry>) -> Self {
        Self { service, rooms }
    }

    pub fn service(&self) -> &PollService {
        &self.service
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Joins the room named after the poll, seats the participant, and tells the room.
    pub async fn connect(
        &self,
        identity: AuthPayload,
        token: String,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> PollResult<Arc<Connection>> {
        let handle = ConnectionHandle::new(&identity.user_id, tx);
        let poll_id = identity.poll_id.clone();

        let members = self.rooms.join(&poll_id, handle.clone());
        info!(
            "Connection {} for user {} ({}) joined room {}; {} connection(s) in room",
            handle.id, identity.user_id, identity.name, poll_id, members
        );

        match self.service.add_participant(&identity).await {
            Ok(poll) => {
                self.rooms.broadcast(&poll_id, ServerEvent::PollUpdated(poll));
                Ok(Arc::new(Connection { handle, identity, token }))
            }
            Err(err) => {
                warn!("Could not seat user {} in poll {}: {}", identity.user_id, poll_id, err);
                self.rooms.leave(&poll_id, handle.id);
                Err(err)
            }
        }
    }

    /// Starts the task that runs one connection's actions in the order its frames
    /// arrived. The task ends once the returned sender is dropped and the queue
    /// is drained.
    pub fn spawn_actions(&self, connection: Arc<Connection>) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let gateway = self.clone();

        let worker = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                gateway.dispatch(&connection, &frame).await;
            }
            debug!("Action queue for connection {} drained", connection.handle.id);
        });

        (tx, worker)
    }

    /// Handles one inbound frame: authenticate, parse, run the action, then either
    /// broadcast the new state to the room or report the failure to the sender only.
    pub async fn dispatch(&self, connection: &Connection, frame: &str) {
        // The token gates the whole connection, not just the handshake
        if let Err(err) = self.service.gate().verify(&connection.token) {
            self.reply(connection, &err);
            connection.handle.close();
            return;
        }

        let action = match ClientAction::parse(frame) {
            Ok(action) => action,
            Err(err) => {
                debug!("Bad frame from connection {}: {}", connection.handle.id, err);
                self.reply(connection, &err);
                return;
            }
        };

        let poll_id = &connection.identity.poll_id;
        debug!("{} from user {} in poll {}", action.name(), connection.identity.user_id, poll_id);

        match self.apply(connection, action).await {
            Ok(Some(event)) => {
                let closes_room = matches!(event, ServerEvent::PollCanceled);
                self.rooms.broadcast(poll_id, event);
                if closes_room {
                    self.rooms.close_room(poll_id);
                }
            }
            Ok(None) => {}
            Err(err) => {
                match &err {
                    PollError::StorageUnavailable(msg) | PollError::Internal(msg) => {
                        error!("Action failed in poll {}: {}", poll_id, msg)
                    }
                    other => warn!("Action refused in poll {}: {}", poll_id, other),
                }
                self.reply(connection, &err);
            }
        }
    }

    /// Action table. `Ok(None)` is a verified no-op and broadcasts nothing.
    async fn apply(&self, connection: &Connection, action: ClientAction) -> PollResult<Option<ServerEvent>> {
        let caller = &connection.identity;

        let poll = match action {
            ClientAction::RemoveParticipant { id } => self.service.kick_participant(caller, &id).await?,
            ClientAction::Nominate { text } => Some(self.service.add_nomination(caller, &text).await?),
            ClientAction::RemoveNomination { id } => Some(self.service.remove_nomination(caller, &id).await?),
            ClientAction::StartVote => Some(self.service.start_poll(caller).await?),
            ClientAction::SubmitRankings { rankings } => Some(self.service.submit_rankings(caller, rankings).await?),
            ClientAction::ClosePoll => Some(self.service.close_poll(caller).await?),
            ClientAction::CancelPoll => {
                self.service.cancel_poll(caller).await?;
                return Ok(Some(ServerEvent::PollCanceled));
            }
        };

        Ok(poll.map(ServerEvent::PollUpdated))
    }

    /// Disconnect effect. Runs as soon as the socket drops; in-flight actions from
    /// the same connection are not waited for.
    pub async fn disconnect(&self, connection: &Connection) {
        let poll_id = &connection.identity.poll_id;
        let user_id = &connection.identity.user_id;

        self.rooms.leave(poll_id, connection.handle.id);
        info!(
            "Connection {} for user {} left room {}; {} connection(s) remain",
            connection.handle.id,
            user_id,
            poll_id,
            self.rooms.room_size(poll_id)
        );

        // Another socket of the same user keeps the seat
        if self.rooms.has_user(poll_id, user_id) {
            return;
        }

        match self.service.leave_poll(&connection.identity).await {
            Ok(Some(poll)) => {
                let poll = self.settle_departure(&connection.identity, poll).await;
                self.rooms.broadcast(poll_id, ServerEvent::PollUpdated(poll));
            }
            Ok(None) => {}
            Err(PollError::NotFound(_)) => debug!("Poll {} is gone, nothing to leave", poll_id),
            Err(err) => error!("Failed to remove user {} from poll {}: {}", user_id, poll_id, err),
        }
    }

    /// A socket of the same user may have joined between the membership check and
    /// the removal. `connect` joins the room before seating, so checking the room
    /// again here is enough to put such a user back.
    async fn settle_departure(&self, identity: &AuthPayload, removed: Poll) -> Poll {
        if !self.rooms.has_user(&identity.poll_id, &identity.user_id) {
            return removed;
        }

        debug!("User {} reconnected to poll {} while leaving", identity.user_id, identity.poll_id);
        match self.service.add_participant(identity).await {
            Ok(poll) => poll,
            Err(err) => {
                error!("Failed to re-seat user {} in poll {}: {}", identity.user_id, identity.poll_id, err);
                removed
            }
        }
    }

    fn reply(&self, connection: &Connection, err: &PollError) {
        connection.handle.send(Arc::new(ServerEvent::from(err)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ExceptionBody;
    use crate::models::CreatePollFields;
    use crate::service::tests::service;

    type Rx = mpsc::UnboundedReceiver<Outbound>;

    async fn gateway() -> Gateway {
        Gateway::new(service().await, Arc::new(RoomRegistry::new()))
    }

    fn drain(rx: &mut Rx) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn events(rx: &mut Rx) -> Vec<ServerEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Event(e) => Some(e.as_ref().clone()),
                Outbound::Close => None,
            })
            .collect()
    }

    fn last_poll(rx: &mut Rx) -> Poll {
        events(rx)
            .into_iter()
            .rev()
            .find_map(|e| match e {
                ServerEvent::PollUpdated(poll) => Some(poll),
                _ => None,
            })
            .expect("a poll_updated event")
    }

    fn exception_kind(rx: &mut Rx) -> Option<String> {
        events(rx).into_iter().find_map(|e| match e {
            ServerEvent::Exception(ExceptionBody { kind, .. }) => Some(kind),
            _ => None,
        })
    }

    async fn join(gateway: &Gateway, token: &str) -> (Arc<Connection>, Rx) {
        let identity = gateway.service().gate().verify(token).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = gateway.connect(identity, token.to_string(), tx).await.unwrap();
        (connection, rx)
    }

    /// Admin and one voter, both connected, with their receivers drained.
    async fn room(gateway: &Gateway) -> (Arc<Connection>, Rx, Arc<Connection>, Rx) {
        let created = gateway
            .service()
            .create_poll(CreatePollFields { topic: "Lunch".into(), votes_per_voter: 2, name: "Ann".into() })
            .await
            .unwrap();
        let (admin, mut admin_rx) = join(gateway, &created.access_token).await;

        let joined = gateway
            .service()
            .join_poll(crate::models::JoinPollFields { poll_id: created.poll.id.clone(), name: "Bob".into() })
            .await
            .unwrap();
        let (voter, mut voter_rx) = join(gateway, &joined.access_token).await;

        drain(&mut admin_rx);
        drain(&mut voter_rx);
        (admin, admin_rx, voter, voter_rx)
    }

    #[tokio::test]
    async fn connecting_seats_the_participant_and_updates_the_room() {
        let gateway = gateway().await;
        let created = gateway
            .service()
            .create_poll(CreatePollFields { topic: "Lunch".into(), votes_per_voter: 2, name: "Ann".into() })
            .await
            .unwrap();
        let (_admin, mut admin_rx) = join(&gateway, &created.access_token).await;
        drain(&mut admin_rx);

        let joined = gateway
            .service()
            .join_poll(crate::models::JoinPollFields { poll_id: created.poll.id.clone(), name: "Bob".into() })
            .await
            .unwrap();
        let (voter, mut voter_rx) = join(&gateway, &joined.access_token).await;

        let seen_by_admin = last_poll(&mut admin_rx);
        assert_eq!(seen_by_admin.participants.get(&voter.identity.user_id).map(String::as_str), Some("Bob"));
        assert_eq!(last_poll(&mut voter_rx), seen_by_admin);
        assert_eq!(gateway.rooms().room_size(&created.poll.id), 2);
    }

    #[tokio::test]
    async fn connecting_to_a_missing_poll_fails_without_joining() {
        let gateway = gateway().await;
        let token = gateway
            .service()
            .gate()
            .sign(&AuthPayload { user_id: "u1".into(), poll_id: "GONE00".into(), name: "Ann".into() })
            .unwrap();
        let identity = gateway.service().gate().verify(&token).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = gateway.connect(identity, token, tx).await;
        assert!(matches!(result, Err(PollError::NotFound(_))));
        assert_eq!(gateway.rooms().room_count(), 0);
    }

    #[tokio::test]
    async fn every_mutation_broadcasts_exactly_once() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&voter, r#"{"event":"nominate","data":{"text":"Tacos"}}"#).await;
        gateway.dispatch(&admin, r#"{"event":"nominate","data":{"text":"Sushi"}}"#).await;

        let admin_events = events(&mut admin_rx);
        assert_eq!(admin_events.len(), 2);
        assert_eq!(events(&mut voter_rx).len(), 2);
        match admin_events.last() {
            Some(ServerEvent::PollUpdated(poll)) => assert_eq!(poll.nominations.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn refusals_go_to_the_sender_only() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&voter, r#"{"event":"start_vote"}"#).await;

        assert_eq!(exception_kind(&mut voter_rx).as_deref(), Some("Forbidden"));
        assert!(drain(&mut admin_rx).is_empty());
    }

    #[tokio::test]
    async fn rankings_before_start_are_refused() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&voter, r#"{"event":"submit_rankings","data":{"rankings":["n1"]}}"#).await;

        assert_eq!(exception_kind(&mut voter_rx).as_deref(), Some("InvalidState"));
        assert!(drain(&mut admin_rx).is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_raise_bad_request() {
        let gateway = gateway().await;
        let (_admin, _admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&voter, r#"{"event":"nominate"}"#).await;
        assert_eq!(exception_kind(&mut voter_rx).as_deref(), Some("BadRequest"));
    }

    #[tokio::test]
    async fn disconnect_before_start_removes_the_participant() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, _voter_rx) = room(&gateway).await;

        gateway.disconnect(&voter).await;

        let poll = last_poll(&mut admin_rx);
        assert!(!poll.participants.contains_key(&voter.identity.user_id));
    }

    #[tokio::test]
    async fn disconnect_after_start_keeps_the_participant() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, voter, _voter_rx) = room(&gateway).await;

        gateway.dispatch(&admin, r#"{"event":"start_vote"}"#).await;
        assert!(last_poll(&mut admin_rx).has_started);

        gateway.disconnect(&voter).await;

        assert!(drain(&mut admin_rx).is_empty());
        let poll = gateway.service().get_poll(&voter.identity.poll_id).await.unwrap();
        assert!(poll.participants.contains_key(&voter.identity.user_id));
    }

    #[tokio::test]
    async fn second_socket_of_the_same_user_keeps_the_seat() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, _voter_rx) = room(&gateway).await;

        let (tx, _second_rx) = mpsc::unbounded_channel();
        gateway
            .connect(voter.identity.clone(), voter.token.clone(), tx)
            .await
            .unwrap();
        drain(&mut admin_rx);

        gateway.disconnect(&voter).await;

        assert!(drain(&mut admin_rx).is_empty());
        let poll = gateway.service().get_poll(&voter.identity.poll_id).await.unwrap();
        assert!(poll.participants.contains_key(&voter.identity.user_id));
    }

    #[tokio::test]
    async fn removing_a_participant_after_start_broadcasts_nothing() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&admin, r#"{"event":"start_vote"}"#).await;
        drain(&mut admin_rx);
        drain(&mut voter_rx);

        let frame = format!(r#"{{"event":"remove_participant","data":{{"id":"{}"}}}}"#, voter.identity.user_id);
        gateway.dispatch(&admin, &frame).await;

        assert!(drain(&mut admin_rx).is_empty());
        assert!(drain(&mut voter_rx).is_empty());
        let poll = gateway.service().get_poll(&admin.identity.poll_id).await.unwrap();
        assert!(poll.participants.contains_key(&voter.identity.user_id));
    }

    #[tokio::test]
    async fn action_finishing_after_disconnect_reaches_only_the_remaining_room() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.disconnect(&voter).await;
        drain(&mut admin_rx);

        gateway.dispatch(&voter, r#"{"event":"nominate","data":{"text":"Late"}}"#).await;

        let poll = last_poll(&mut admin_rx);
        assert!(poll.nominations.values().any(|n| n.text == "Late"));
        assert!(drain(&mut voter_rx).is_empty());

        let stored = gateway.service().get_poll(&voter.identity.poll_id).await.unwrap();
        assert_eq!(stored.nominations.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn frames_from_one_connection_apply_in_arrival_order() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, _voter, _voter_rx) = room(&gateway).await;

        gateway.dispatch(&admin, r#"{"event":"nominate","data":{"text":"Tacos"}}"#).await;
        gateway.dispatch(&admin, r#"{"event":"nominate","data":{"text":"Sushi"}}"#).await;
        let ids: Vec<String> = last_poll(&mut admin_rx).nominations.keys().cloned().collect();

        let (actions, worker) = gateway.spawn_actions(Arc::clone(&admin));
        actions.send(r#"{"event":"start_vote"}"#.to_string()).unwrap();
        for round in 0..20 {
            let (first, second) = if round % 2 == 0 { (&ids[0], &ids[1]) } else { (&ids[1], &ids[0]) };
            let frame = format!(r#"{{"event":"submit_rankings","data":{{"rankings":["{}","{}"]}}}}"#, first, second);
            actions.send(frame).unwrap();
        }
        let last = vec![ids[0].clone()];
        actions
            .send(format!(r#"{{"event":"submit_rankings","data":{{"rankings":["{}"]}}}}"#, last[0]))
            .unwrap();
        actions.send(r#"{"event":"close_poll"}"#.to_string()).unwrap();
        drop(actions);
        worker.await.unwrap();

        assert_eq!(exception_kind(&mut admin_rx), None);
        let poll = gateway.service().get_poll(&admin.identity.poll_id).await.unwrap();
        assert!(poll.has_ended);
        assert_eq!(poll.rankings.get(&admin.identity.user_id), Some(&last));
        assert_eq!(poll.results.len(), 1);
        assert_eq!(poll.results[0].nomination_id, ids[0]);
    }

    #[tokio::test]
    async fn reconnect_during_departure_keeps_the_seat() {
        let gateway = gateway().await;
        let (_admin, mut admin_rx, voter, _voter_rx) = room(&gateway).await;

        // The old socket has left and its removal already hit the store
        gateway.rooms().leave(&voter.identity.poll_id, voter.handle.id);
        let removed = gateway.service().leave_poll(&voter.identity).await.unwrap().unwrap();
        assert!(!removed.participants.contains_key(&voter.identity.user_id));

        // Meanwhile a new socket for the same user joined the room
        let (tx, _new_rx) = mpsc::unbounded_channel();
        gateway
            .rooms()
            .join(&voter.identity.poll_id, ConnectionHandle::new(voter.identity.user_id.clone(), tx));

        let settled = gateway.settle_departure(&voter.identity, removed).await;
        assert!(settled.participants.contains_key(&voter.identity.user_id));

        let stored = gateway.service().get_poll(&voter.identity.poll_id).await.unwrap();
        assert!(stored.participants.contains_key(&voter.identity.user_id));
        assert!(drain(&mut admin_rx).is_empty());
    }

    #[tokio::test]
    async fn cancel_tells_the_room_and_hangs_up() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, _voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&admin, r#"{"event":"cancel_poll"}"#).await;

        for rx in [&mut admin_rx, &mut voter_rx] {
            let messages = drain(rx);
            assert!(matches!(&messages[0], Outbound::Event(e) if **e == ServerEvent::PollCanceled));
            assert!(matches!(messages[1], Outbound::Close));
        }
        assert_eq!(gateway.rooms().room_size(&admin.identity.poll_id), 0);
        assert!(gateway.service().get_poll(&admin.identity.poll_id).await.is_err());
    }

    #[tokio::test]
    async fn full_vote_reaches_results() {
        let gateway = gateway().await;
        let (admin, mut admin_rx, voter, mut voter_rx) = room(&gateway).await;

        gateway.dispatch(&voter, r#"{"event":"nominate","data":{"text":"Tacos"}}"#).await;
        let poll = last_poll(&mut voter_rx);
        let tacos = poll.nominations.keys().next().cloned().unwrap();
        gateway.dispatch(&admin, r#"{"event":"start_vote"}"#).await;

        let frame = format!(r#"{{"event":"submit_rankings","data":{{"rankings":["{}"]}}}}"#, tacos);
        gateway.dispatch(&voter, &frame).await;
        gateway.dispatch(&admin, r#"{"event":"close_poll"}"#).await;

        let poll = last_poll(&mut admin_rx);
        assert_eq!(poll.results.len(), 1);
        assert_eq!(poll.results[0].nomination_text, "Tacos");
        assert_eq!(poll.results[0].score, 1.0);
    }

    #[tokio::test]
    async fn invalid_token_ends_the_connection() {
        let gateway = gateway().await;
        let (admin, _admin_rx, _voter, _voter_rx) = room(&gateway).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stale = Connection {
            handle: ConnectionHandle::new(admin.identity.user_id.clone(), tx),
            identity: admin.identity.clone(),
            token: "expired.or.forged".to_string(),
        };

        gateway.dispatch(&stale, r#"{"event":"start_vote"}"#).await;

        let messages = drain(&mut rx);
        assert!(matches!(&messages[0], Outbound::Event(e) if matches!(**e, ServerEvent::Exception(ref b) if b.kind == "Unauthenticated")));
        assert!(matches!(messages[1], Outbound::Close));
        assert!(!gateway.service().get_poll(&admin.identity.poll_id).await.unwrap().has_started);
    }
}
