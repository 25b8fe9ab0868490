//! Wire codec for dripline messages.
//!
//! A message is split across two carriers: the JSON body holds `msgtype`,
//! `timestamp`, `sender_info`, the kind-specific fields, and `payload`;
//! the routing key, reply-to, correlation id, and content encoding ride
//! the AMQP envelope. [`DeliveryMeta`] captures the envelope half so that
//! decoding stays testable without a broker.

use chrono::{DateTime, Utc};
use lapin::message::Delivery;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Alert, Encoding, Envelope, Info, Message, MsgOp, MsgType, Reply, Request, ReturnCode,
    SenderInfo,
};

/// Errors raised while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("delivery carries no content encoding")]
    MissingEncoding,

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("malformed message body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error("unknown message type code {0}")]
    UnknownMsgType(u32),

    #[error("unknown operation code {0}")]
    UnknownOp(u32),

    #[error("{kind} message is missing its {field} field")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Transport-side properties of a delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryMeta {
    pub routing_key: String,
    pub reply_to: String,
    pub corr_id: String,
    /// Raw content-encoding tag; `None` when the sender omitted it.
    pub encoding: Option<String>,
}

impl DeliveryMeta {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let properties = &delivery.properties;
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            reply_to: properties
                .reply_to()
                .as_ref()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            corr_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            encoding: properties
                .content_encoding()
                .as_ref()
                .map(|s| s.as_str().to_string()),
        }
    }
}

/// The serialized shape of a message body. Kind-specific fields are
/// optional here and validated per kind during decode.
#[derive(Debug, Serialize, Deserialize)]
struct WireBody {
    msgtype: u32,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    sender_info: SenderInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msgop: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retcode: Option<ReturnCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    return_msg: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Serialize a message body per its envelope encoding.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let envelope = message.envelope();
    let body = WireBody {
        msgtype: message.msg_type().code(),
        timestamp: envelope.timestamp,
        sender_info: envelope.sender_info.clone(),
        msgop: match message {
            Message::Request(request) => Some(request.op.code()),
            _ => None,
        },
        retcode: match message {
            Message::Reply(reply) => Some(reply.ret_code),
            _ => None,
        },
        return_msg: match message {
            Message::Reply(reply) => Some(reply.return_msg.clone()),
            _ => None,
        },
        payload: message.payload().clone(),
    };
    match envelope.encoding {
        Encoding::Json => Ok(serde_json::to_vec(&body)?),
    }
}

/// Decode a message body and merge the transport properties back into its
/// envelope.
pub fn decode(body: &[u8], meta: DeliveryMeta) -> Result<Message, CodecError> {
    let tag = meta
        .encoding
        .as_deref()
        .filter(|tag| !tag.is_empty())
        .ok_or(CodecError::MissingEncoding)?;
    let encoding =
        Encoding::from_mime(tag).ok_or_else(|| CodecError::UnsupportedEncoding(tag.to_string()))?;

    let wire: WireBody = match encoding {
        Encoding::Json => serde_json::from_slice(body)?,
    };

    let envelope = Envelope {
        target: meta.routing_key,
        encoding,
        reply_to: meta.reply_to,
        corr_id: meta.corr_id,
        timestamp: wire.timestamp,
        sender_info: wire.sender_info,
    };

    let msg_type =
        MsgType::from_code(wire.msgtype).ok_or(CodecError::UnknownMsgType(wire.msgtype))?;
    let message = match msg_type {
        MsgType::Request => {
            let code = wire.msgop.ok_or(CodecError::MissingField {
                kind: "request",
                field: "msgop",
            })?;
            let op = MsgOp::from_code(code).ok_or(CodecError::UnknownOp(code))?;
            Message::Request(Request {
                envelope,
                op,
                payload: wire.payload,
            })
        }
        MsgType::Reply => {
            let ret_code = wire.retcode.ok_or(CodecError::MissingField {
                kind: "reply",
                field: "retcode",
            })?;
            Message::Reply(Reply {
                envelope,
                ret_code,
                return_msg: wire.return_msg.unwrap_or_default(),
                payload: wire.payload,
            })
        }
        MsgType::Alert => Message::Alert(Alert {
            envelope,
            payload: wire.payload,
        }),
        MsgType::Info => Message::Info(Info {
            envelope,
            payload: wire.payload,
        }),
    };
    Ok(message)
}

impl Message {
    /// Decode a broker delivery into a typed message.
    pub fn from_delivery(delivery: &Delivery) -> Result<Message, CodecError> {
        decode(&delivery.data, DeliveryMeta::from_delivery(delivery))
    }
}
