use crate::error::{Result, SessionError};
use crate::peer::types::SessionDescription;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Роль клиента в комнате: `create` публикует, `join` смотрит
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Create,
    Join,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Create => f.write_str("create"),
            Role::Join => f.write_str("join"),
        }
    }
}

/// Сообщение протокола relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Join {
        room_name: String,
        user_id: String,
        offer: SessionDescription,
    },
    Create {
        room_name: String,
        user_id: String,
        offer: SessionDescription,
    },
    Control {
        room_name: String,
        user_id: String,
        detail: String,
    },
    Answer {
        answer: SessionDescription,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferCommand {
    user_id: String,
    sdp: String,
    room_name: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlCommand {
    cmd_detail: String,
    user_id: String,
    room_name: String,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum CommandWire {
    Join(OfferCommand),
    Create(OfferCommand),
    Control(ControlCommand),
}

#[derive(Serialize, Deserialize)]
struct AnswerReply {
    #[serde(rename = "type")]
    kind: String,
    answer: String,
}

/// Ошибка сериализации исходящего сообщения относится к каналу,
/// а не к разбору ответа relay
fn to_wire<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| SessionError::Signaling(format!("cannot encode outbound message: {e}")))
}

/// JSON → base64, как `btoa(JSON.stringify(desc))`
pub fn encode_description(desc: &SessionDescription) -> Result<String> {
    let json = to_wire(desc)?;
    Ok(general_purpose::STANDARD.encode(json))
}

pub fn decode_description(encoded: &str) -> Result<SessionDescription> {
    let raw = general_purpose::STANDARD.decode(encoded.trim())?;
    let desc = serde_json::from_slice(&raw)?;
    Ok(desc)
}

impl SignalingMessage {
    pub fn offer(role: Role, room_name: &str, user_id: &str, offer: SessionDescription) -> Self {
        let room_name = room_name.to_owned();
        let user_id = user_id.to_owned();
        match role {
            Role::Create => SignalingMessage::Create {
                room_name,
                user_id,
                offer,
            },
            Role::Join => SignalingMessage::Join {
                room_name,
                user_id,
                offer,
            },
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Create { .. } => "create",
            SignalingMessage::Control { .. } => "control",
            SignalingMessage::Answer { .. } => "answer",
        }
    }

    pub fn encode(&self) -> Result<String> {
        let text = match self {
            SignalingMessage::Join {
                room_name,
                user_id,
                offer,
            } => to_wire(&CommandWire::Join(OfferCommand {
                user_id: user_id.clone(),
                sdp: encode_description(offer)?,
                room_name: room_name.clone(),
            }))?,
            SignalingMessage::Create {
                room_name,
                user_id,
                offer,
            } => to_wire(&CommandWire::Create(OfferCommand {
                user_id: user_id.clone(),
                sdp: encode_description(offer)?,
                room_name: room_name.clone(),
            }))?,
            SignalingMessage::Control {
                room_name,
                user_id,
                detail,
            } => to_wire(&CommandWire::Control(ControlCommand {
                cmd_detail: detail.clone(),
                user_id: user_id.clone(),
                room_name: room_name.clone(),
            }))?,
            SignalingMessage::Answer { answer } => to_wire(&AnswerReply {
                kind: "answer".into(),
                answer: encode_description(answer)?,
            })?,
        };
        Ok(text)
    }

    /// `Ok(None)` — сообщение понятно, но не для ядра (другие `type`)
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if value.get("cmd").is_some() {
            let cmd: CommandWire = serde_json::from_value(value)?;
            let msg = match cmd {
                CommandWire::Join(c) => SignalingMessage::Join {
                    offer: decode_description(&c.sdp)?,
                    room_name: c.room_name,
                    user_id: c.user_id,
                },
                CommandWire::Create(c) => SignalingMessage::Create {
                    offer: decode_description(&c.sdp)?,
                    room_name: c.room_name,
                    user_id: c.user_id,
                },
                CommandWire::Control(c) => SignalingMessage::Control {
                    room_name: c.room_name,
                    user_id: c.user_id,
                    detail: c.cmd_detail,
                },
            };
            return Ok(Some(msg));
        }

        match value.get("type").and_then(|t| t.as_str()) {
            Some("answer") => {
                let reply: AnswerReply = serde_json::from_value(value)?;
                Ok(Some(SignalingMessage::Answer {
                    answer: decode_description(&reply.answer)?,
                }))
            }
            Some(other) => {
                debug!("Ignoring signaling message of type '{other}'");
                Ok(None)
            }
            None => Err(SessionError::ProtocolDecode(
                "message has neither 'type' nor 'cmd'".into(),
            )),
        }
    }
}
