use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::commands::ServerEvent;

pub type ConnectionId = Uuid;

/// What a connection's writer task is asked to do next.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Close,
}

/// Handle used to push events to one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id: Uuid::new_v4(), user_id: user_id.into(), tx }
    }

    /// Returns `false` once the socket's writer has gone away.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// pollId -> live connections. Join, leave and broadcast are synchronous so a
/// broadcast only ever reaches connections joined at that moment.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, HashMap<ConnectionId, ConnectionHandle>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, poll_id: &str, handle: ConnectionHandle) -> usize {
        let mut room = self.rooms.entry(poll_id.to_string()).or_default();
        room.insert(handle.id, handle);
        room.len()
    }

    /// Removes the connection and drops the room once it is empty.
    pub fn leave(&self, poll_id: &str, connection_id: ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(poll_id) {
            Some(mut room) => room.remove(&connection_id).is_some(),
            None => false,
        };
        self.rooms.remove_if(poll_id, |_, room| room.is_empty());
        removed
    }

    pub fn room_size(&self, poll_id: &str) -> usize {
        self.rooms.get(poll_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether `user_id` still has any connection in the room.
    pub fn has_user(&self, poll_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(poll_id)
            .map(|room| room.values().any(|handle| handle.user_id == user_id))
            .unwrap_or(false)
    }

    /// Sends `event` to every member of the room, returning how many received it.
    pub fn broadcast(&self, poll_id: &str, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let Some(room) = self.rooms.get(poll_id) else {
            return 0;
        };

        let delivered = room.values().filter(|handle| handle.send(Arc::clone(&event))).count();
        debug!("Broadcast to room {}: {}/{} connection(s)", poll_id, delivered, room.len());
        delivered
    }

    /// Asks every member to hang up and forgets the room. Used once its poll is gone,
    /// so a later poll reusing the id never reaches stale sockets.
    pub fn close_room(&self, poll_id: &str) -> usize {
        match self.rooms.remove(poll_id) {
            Some((_, room)) => {
                for handle in room.values() {
                    handle.close();
                }
                room.len()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user_id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(user_id, tx), rx)
    }

    #[test]
    fn broadcast_reaches_only_the_room() {
        let rooms = RoomRegistry::new();
        let (a, mut a_rx) = handle("a");
        let (b, mut b_rx) = handle("b");
        let (c, mut c_rx) = handle("c");
        rooms.join("ROOM01", a);
        rooms.join("ROOM01", b);
        rooms.join("ROOM02", c);

        assert_eq!(rooms.broadcast("ROOM01", ServerEvent::PollCanceled), 2);
        assert!(matches!(a_rx.try_recv(), Ok(Outbound::Event(_))));
        assert!(matches!(b_rx.try_recv(), Ok(Outbound::Event(_))));
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn leaving_stops_delivery_and_empties_rooms() {
        let rooms = RoomRegistry::new();
        let (a, mut a_rx) = handle("a");
        let id = a.id;
        rooms.join("ROOM01", a);
        assert!(rooms.has_user("ROOM01", "a"));

        assert!(rooms.leave("ROOM01", id));
        assert!(!rooms.leave("ROOM01", id));
        assert_eq!(rooms.broadcast("ROOM01", ServerEvent::PollCanceled), 0);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(rooms.room_count(), 0);
        assert!(!rooms.has_user("ROOM01", "a"));
    }

    #[test]
    fn dead_receivers_are_not_counted() {
        let rooms = RoomRegistry::new();
        let (a, a_rx) = handle("a");
        rooms.join("ROOM01", a);
        drop(a_rx);
        assert_eq!(rooms.broadcast("ROOM01", ServerEvent::PollCanceled), 0);
        assert_eq!(rooms.room_size("ROOM01"), 1);
    }

    #[test]
    fn closing_a_room_hangs_up_every_member() {
        let rooms = RoomRegistry::new();
        let (a, mut a_rx) = handle("a");
        let (b, mut b_rx) = handle("b");
        rooms.join("ROOM01", a);
        rooms.join("ROOM01", b);

        assert_eq!(rooms.close_room("ROOM01"), 2);
        assert!(matches!(a_rx.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(b_rx.try_recv(), Ok(Outbound::Close)));
        assert_eq!(rooms.room_size("ROOM01"), 0);
        assert_eq!(rooms.close_room("ROOM01"), 0);
    }
}
