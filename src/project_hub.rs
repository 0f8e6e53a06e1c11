use std::collections::{BTreeSet, HashMap};

use actix::prelude::*;
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::models::Message as ChatMessage;

/// Events pushed to socket clients, framed as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ProjectMessage(ChatMessage),
    TypingStart { user_id: String, name: String },
    TypingStop { user_id: String, name: String },
}

/// Delivery of a room event to one session.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct HubEvent(pub ServerEvent);

#[derive(Message)]
#[rtype(result = "()")]
pub struct Join {
    pub project_id: String,
    pub session_id: Uuid,
    pub user_id: String,
    pub addr: Recipient<HubEvent>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Leave {
    pub project_id: String,
    pub session_id: Uuid,
}

/// Fan an event out to a room. `skip` excludes the originating session.
#[derive(Message)]
#[rtype(result = "usize")]
pub struct Broadcast {
    pub project_id: String,
    pub event: ServerEvent,
    pub skip: Option<Uuid>,
}

/// Distinct user ids connected to a room.
#[derive(Message)]
#[rtype(result = "Vec<String>")]
pub struct Presence {
    pub project_id: String,
}

struct RoomMember {
    user_id: String,
    addr: Recipient<HubEvent>,
}

/// Owns every project room. Sessions join on connect and leave on stop; a
/// room disappears with its last session.
#[derive(Default)]
pub struct ProjectHub {
    rooms: HashMap<String, HashMap<Uuid, RoomMember>>,
}

impl ProjectHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for ProjectHub {
    type Context = Context<Self>;
}

impl Handler<Join> for ProjectHub {
    type Result = ();

    fn handle(&mut self, msg: Join, _: &mut Context<Self>) {
        info!(
            "User {} joined project room {} (session {})",
            msg.user_id, msg.project_id, msg.session_id
        );
        self.rooms.entry(msg.project_id).or_default().insert(
            msg.session_id,
            RoomMember {
                user_id: msg.user_id,
                addr: msg.addr,
            },
        );
    }
}

impl Handler<Leave> for ProjectHub {
    type Result = ();

    fn handle(&mut self, msg: Leave, _: &mut Context<Self>) {
        if let Some(room) = self.rooms.get_mut(&msg.project_id) {
            if let Some(member) = room.remove(&msg.session_id) {
                info!("User {} left project room {}", member.user_id, msg.project_id);
            }
            if room.is_empty() {
                self.rooms.remove(&msg.project_id);
            }
        }
    }
}

impl Handler<Broadcast> for ProjectHub {
    type Result = usize;

    fn handle(&mut self, msg: Broadcast, _: &mut Context<Self>) -> usize {
        let Some(room) = self.rooms.get(&msg.project_id) else {
            return 0;
        };
        let mut delivered = 0;
        for (session_id, member) in room {
            if Some(*session_id) == msg.skip {
                continue;
            }
            member.addr.do_send(HubEvent(msg.event.clone()));
            delivered += 1;
        }
        debug!("Broadcast to room {} reached {} sessions", msg.project_id, delivered);
        delivered
    }
}

impl Handler<Presence> for ProjectHub {
    type Result = MessageResult<Presence>;

    fn handle(&mut self, msg: Presence, _: &mut Context<Self>) -> Self::Result {
        let users: BTreeSet<String> = self
            .rooms
            .get(&msg.project_id)
            .map(|room| room.values().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default();
        MessageResult(users.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[derive(Default)]
    struct Collector {
        received: Vec<ServerEvent>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<HubEvent> for Collector {
        type Result = ();

        fn handle(&mut self, msg: HubEvent, _: &mut Context<Self>) {
            self.received.push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "Vec<ServerEvent>")]
    struct Take;

    impl Handler<Take> for Collector {
        type Result = MessageResult<Take>;

        fn handle(&mut self, _: Take, _: &mut Context<Self>) -> Self::Result {
            MessageResult(std::mem::take(&mut self.received))
        }
    }

    fn typing(user: &str) -> ServerEvent {
        ServerEvent::TypingStart {
            user_id: user.to_string(),
            name: user.to_string(),
        }
    }

    async fn join(hub: &Addr<ProjectHub>, project: &str, user: &str) -> (Uuid, Addr<Collector>) {
        let session_id = Uuid::new_v4();
        let collector = Collector::default().start();
        hub.send(Join {
            project_id: project.to_string(),
            session_id,
            user_id: user.to_string(),
            addr: collector.clone().recipient(),
        })
        .await
        .unwrap();
        (session_id, collector)
    }

    #[actix_web::test]
    async fn broadcast_skips_sender_and_other_rooms() {
        let hub = ProjectHub::new().start();
        let (alice_session, alice) = join(&hub, "p1", "alice").await;
        let (_, bob) = join(&hub, "p1", "bob").await;
        let (_, carol) = join(&hub, "p2", "carol").await;

        let delivered = hub
            .send(Broadcast {
                project_id: "p1".into(),
                event: typing("alice"),
                skip: Some(alice_session),
            })
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(bob.send(Take).await.unwrap(), vec![typing("alice")]);
        assert!(alice.send(Take).await.unwrap().is_empty());
        assert!(carol.send(Take).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn broadcast_without_skip_reaches_everyone() {
        let hub = ProjectHub::new().start();
        let (_, alice) = join(&hub, "p1", "alice").await;
        let (_, bob) = join(&hub, "p1", "bob").await;

        let reply = ChatMessage::from_ai("hello".into(), None, None);
        let event = ServerEvent::ProjectMessage(reply);
        hub.send(Broadcast {
            project_id: "p1".into(),
            event: event.clone(),
            skip: None,
        })
        .await
        .unwrap();

        assert_eq!(alice.send(Take).await.unwrap(), vec![event.clone()]);
        assert_eq!(bob.send(Take).await.unwrap(), vec![event]);
    }

    #[actix_web::test]
    async fn presence_tracks_joins_and_leaves() {
        let hub = ProjectHub::new().start();
        let (first, _a1) = join(&hub, "p1", "alice").await;
        let (_second, _a2) = join(&hub, "p1", "alice").await;
        let (bob_session, _b) = join(&hub, "p1", "bob").await;

        let present = hub.send(Presence { project_id: "p1".into() }).await.unwrap();
        assert_eq!(present, vec!["alice".to_string(), "bob".to_string()]);

        hub.send(Leave { project_id: "p1".into(), session_id: bob_session })
            .await
            .unwrap();
        hub.send(Leave { project_id: "p1".into(), session_id: first })
            .await
            .unwrap();
        let present = hub.send(Presence { project_id: "p1".into() }).await.unwrap();
        assert_eq!(present, vec!["alice".to_string()]);
    }

    #[test]
    fn events_use_socket_framing() {
        let json = serde_json::to_value(typing("u1")).unwrap();
        assert_eq!(json["event"], "typing-start");
        assert_eq!(json["data"]["user_id"], "u1");

        let msg = ChatMessage {
            id: "m1".into(),
            sender: "u1".into(),
            sender_name: None,
            text: "hi".into(),
            session_id: None,
            model_type: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(ServerEvent::ProjectMessage(msg)).unwrap();
        assert_eq!(json["event"], "project-message");
        assert_eq!(json["data"]["text"], "hi");
    }
}
