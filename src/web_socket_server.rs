use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, error, info, warn};
use mongodb::bson::doc;
use serde::Deserialize;
use uuid::Uuid;

use crate::ai::mentions_ai;
use crate::app_state::AppState;
use crate::auth::{authenticate_token, AuthenticatedUser};
use crate::errors::ApiError;
use crate::models::{Message as ChatMessage, NewMessage};
use crate::project::{append_message, load_member_project, Appended};
use crate::project_hub::{Broadcast, HubEvent, Join, Leave, ProjectHub, ServerEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Events a client may send, framed like the server's events.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
enum ClientEvent {
    ProjectMessage(NewMessage),
    TypingStart,
    TypingStop,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(alias = "projectId")]
    pub project_id: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Generates, stores and broadcasts the assistant's answer when `message`
/// tags it. The reply goes to the whole room, sender included.
pub async fn answer_mention(state: web::Data<AppState>, project_id: String, message: ChatMessage) {
    if !mentions_ai(&message.text) || message.is_from_ai() {
        return;
    }
    let reply = state.ai.reply(&message.text, message.model_type.as_deref()).await;
    let text = serde_json::to_string(&reply).unwrap_or(reply.text);
    let ai_message = ChatMessage::from_ai(text, message.session_id, message.model_type);

    if let Err(e) = append_message(&state.mongodb, &project_id, &ai_message).await {
        error!("Failed to store AI reply in project {}: {}", project_id, e);
    }
    state.hub.do_send(Broadcast {
        project_id,
        event: ServerEvent::ProjectMessage(ai_message),
        skip: None,
    });
}

/// Background variant for callers that already stored `message`.
pub fn spawn_ai_reply(state: web::Data<AppState>, project_id: String, message: &ChatMessage) {
    actix::spawn(answer_mention(state, project_id, message.clone()));
}

/// A resent message id is already in the log and in the room. A failed write
/// is still relayed.
fn should_relay(stored: &Result<Appended, ApiError>) -> bool {
    !matches!(stored, Ok(Appended::Duplicate))
}

/// Runs after the socket message's append so the room and the assistant see
/// messages in log order.
pub async fn relay_message(
    state: web::Data<AppState>,
    project_id: String,
    origin: Uuid,
    message: ChatMessage,
    stored: Result<Appended, ApiError>,
) {
    if let Err(e) = &stored {
        error!("Failed to store message in project {}: {}", project_id, e);
    }
    if !should_relay(&stored) {
        debug!("Message {} already in project {}, not relayed", message.id, project_id);
        return;
    }
    state.hub.do_send(Broadcast {
        project_id: project_id.clone(),
        event: ServerEvent::ProjectMessage(message.clone()),
        skip: Some(origin),
    });
    answer_mention(state, project_id, message).await;
}

pub struct WsSession {
    pub id: Uuid,
    pub hb: Instant,
    pub user_id: String,
    pub user_name: String,
    pub project_id: String,
    pub hub: Addr<ProjectHub>,
    pub state: web::Data<AppState>,
}

impl WsSession {
    pub fn new(
        user_id: String,
        user_name: String,
        project_id: String,
        state: web::Data<AppState>,
    ) -> Self {
        WsSession {
            id: Uuid::new_v4(),
            hb: Instant::now(),
            user_id,
            user_name,
            project_id,
            hub: state.hub.clone(),
            state,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                info!("WebSocket heartbeat failed for user {}, disconnecting", act.user_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        let frame = serde_json::json!({ "event": "error", "data": { "message": message } });
        ctx.text(frame.to_string());
    }

    fn handle_event(&mut self, event: ClientEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event {
            ClientEvent::ProjectMessage(payload) => {
                if let Err(errors) = payload.validate() {
                    let reason = errors
                        .iter()
                        .map(|e| e.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.send_error(ctx, &reason);
                    return;
                }
                let message = payload.into_message(&self.user_id, Some(self.user_name.clone()));
                let state = self.state.clone();
                let project_id = self.project_id.clone();
                let origin = self.id;
                actix::spawn(async move {
                    let stored = append_message(&state.mongodb, &project_id, &message).await;
                    relay_message(state, project_id, origin, message, stored).await;
                });
            }
            ClientEvent::TypingStart => self.hub.do_send(Broadcast {
                project_id: self.project_id.clone(),
                event: ServerEvent::TypingStart {
                    user_id: self.user_id.clone(),
                    name: self.user_name.clone(),
                },
                skip: Some(self.id),
            }),
            ClientEvent::TypingStop => self.hub.do_send(Broadcast {
                project_id: self.project_id.clone(),
                event: ServerEvent::TypingStop {
                    user_id: self.user_id.clone(),
                    name: self.user_name.clone(),
                },
                skip: Some(self.id),
            }),
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);

        let addr = ctx.address();
        self.hub
            .send(Join {
                project_id: self.project_id.clone(),
                session_id: self.id,
                user_id: self.user_id.clone(),
                addr: addr.recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                if res.is_err() {
                    error!("Failed to join room {} for user {}", act.project_id, act.user_id);
                    ctx.stop();
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.hub.do_send(Leave {
            project_id: self.project_id.clone(),
            session_id: self.id,
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.handle_event(event, ctx),
                    Err(e) => {
                        warn!("Unparsable socket event from {}: {}", self.user_id, e);
                        self.send_error(ctx, "Unrecognised event");
                    }
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error for user {}: {}", self.user_id, e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<HubEvent> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: HubEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(&msg.0) {
            Ok(frame) => ctx.text(frame),
            Err(e) => error!("Failed to encode room event: {}", e),
        }
    }
}

/// GET /ws?projectId=...&token=...
///
/// Browsers cannot set headers on a socket handshake, so the token may also
/// come in the query string.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let from_header = req.extensions().get::<AuthenticatedUser>().cloned();
    let user = match from_header {
        Some(user) => user,
        None => {
            let token = query
                .token
                .as_deref()
                .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string()))?;
            authenticate_token(token, &data)?
        }
    };

    load_member_project(&data.mongodb, &query.project_id, &user.id, false).await?;
    let account = data
        .mongodb
        .users()
        .find_one(doc! { "_id": &user.id })
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))?;

    debug!("Upgrading socket for user {} in project {}", user.id, query.project_id);
    let session = WsSession::new(
        user.id,
        account.label(),
        query.into_inner().project_id,
        data,
    );
    ws::start(session, &req, stream).map_err(|e| ApiError::BadRequest(e.to_string()))
}
