//! Dripline message model.
//!
//! Four message kinds travel the bus: requests, replies, alerts, and infos.
//! They share an envelope (addressing, correlation, provenance) and differ
//! only in the kind-specific fields they serialize. Dispatch is by the wire
//! `msgtype` discriminator rather than by payload inspection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::ExchangeConfig;

pub mod codec;

/// Wire discriminator for the four message kinds.
///
/// The codes are fixed by the wire protocol; peers in other languages rely
/// on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Reply,
    Request,
    Alert,
    Info,
}

impl MsgType {
    /// The numeric code serialized as `msgtype`.
    pub fn code(self) -> u32 {
        match self {
            MsgType::Reply => 2,
            MsgType::Request => 3,
            MsgType::Alert => 4,
            MsgType::Info => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            2 => Some(MsgType::Reply),
            3 => Some(MsgType::Request),
            4 => Some(MsgType::Alert),
            5 => Some(MsgType::Info),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::Reply => "reply",
            MsgType::Request => "request",
            MsgType::Alert => "alert",
            MsgType::Info => "info",
        };
        write!(f, "{name}")
    }
}

/// Operation requested of the target endpoint.
///
/// The gap between `Get` and `Config` is deliberate: codes 2 through 5 were
/// retired from the protocol and must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgOp {
    Set,
    Get,
    Config,
    Send,
    Run,
    Cmd,
}

impl MsgOp {
    /// The numeric code serialized as `msgop`.
    pub fn code(self) -> u32 {
        match self {
            MsgOp::Set => 0,
            MsgOp::Get => 1,
            MsgOp::Config => 6,
            MsgOp::Send => 7,
            MsgOp::Run => 8,
            MsgOp::Cmd => 9,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MsgOp::Set),
            1 => Some(MsgOp::Get),
            6 => Some(MsgOp::Config),
            7 => Some(MsgOp::Send),
            8 => Some(MsgOp::Run),
            9 => Some(MsgOp::Cmd),
            _ => None,
        }
    }
}

impl fmt::Display for MsgOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgOp::Set => "set",
            MsgOp::Get => "get",
            MsgOp::Config => "config",
            MsgOp::Send => "send",
            MsgOp::Run => "run",
            MsgOp::Cmd => "cmd",
        };
        write!(f, "{name}")
    }
}

/// Status code carried by replies.
///
/// This is an open code space: peers may send values not named here, and
/// they must survive decoding untouched. The named constants cover the
/// codes this crate itself produces or inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnCode(pub u32);

impl ReturnCode {
    pub const SUCCESS: Self = Self(0);
    pub const WARNING_NO_ACTION: Self = Self(1);

    pub const AMQP_ERROR: Self = Self(100);
    pub const AMQP_ERROR_BROKER: Self = Self(101);
    pub const AMQP_ERROR_ROUTING: Self = Self(102);

    pub const MESSAGE_ERROR: Self = Self(300);
    pub const MESSAGE_ERROR_NO_ENCODING: Self = Self(301);
    pub const MESSAGE_ERROR_DECODING_FAIL: Self = Self(302);
    pub const MESSAGE_ERROR_BAD_PAYLOAD: Self = Self(303);

    pub const CLIENT_ERROR: Self = Self(400);
    pub const CLIENT_ERROR_SEND: Self = Self(401);
    pub const CLIENT_ERROR_TIMEOUT: Self = Self(404);

    pub const UNHANDLED: Self = Self(500);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload serialization scheme, carried as the AMQP content-encoding
/// property. JSON is the only codec currently spoken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Json,
}

impl Encoding {
    pub fn as_mime(self) -> &'static str {
        match self {
            Encoding::Json => "application/json",
        }
    }

    pub fn from_mime(tag: &str) -> Option<Self> {
        match tag {
            "application/json" => Some(Encoding::Json),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_mime())
    }
}

/// Provenance attached to outbound messages: which program, where, run by
/// whom. Peers use it for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderInfo {
    pub package: String,
    pub exe: String,
    pub version: String,
    pub hostname: String,
    pub username: String,
}

impl SenderInfo {
    /// Capture the running process's identity. Lookup failures degrade to
    /// empty fields; provenance is never worth failing a send over.
    pub fn snapshot() -> Self {
        let exe = match std::env::current_exe() {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                warn!(error = %e, "Unable to resolve the executable path for sender info");
                String::new()
            }
        };
        Self {
            package: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            exe,
            hostname: hostname(),
            username: username(),
        }
    }

    /// True when no field has been filled in yet.
    pub fn is_unset(&self) -> bool {
        *self == Self::default()
    }
}

fn hostname() -> String {
    #[cfg(unix)]
    if let Ok(name) = nix::unistd::gethostname() {
        return name.to_string_lossy().into_owned();
    }
    std::env::var("HOSTNAME").unwrap_or_default()
}

fn username() -> String {
    #[cfg(unix)]
    if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_default()
}

/// Fields common to all four message kinds.
///
/// `target`, `reply_to`, `corr_id`, and `encoding` ride the AMQP envelope
/// (routing key and message properties); `timestamp` and `sender_info` are
/// serialized in the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Routing key the message is addressed to.
    pub target: String,
    pub encoding: Encoding,
    /// Routing key replies should be published under; empty when no reply
    /// is expected.
    pub reply_to: String,
    /// Correlation identifier tying a reply to its request. Assigned at
    /// publish time when left empty.
    pub corr_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender_info: SenderInfo,
}

impl Envelope {
    /// A fresh envelope addressed to `target`, timestamped now.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            encoding: Encoding::default(),
            reply_to: String::new(),
            corr_id: String::new(),
            timestamp: Utc::now(),
            sender_info: SenderInfo::default(),
        }
    }
}

/// A command addressed to a named endpoint. Expects exactly one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub envelope: Envelope,
    pub op: MsgOp,
    pub payload: Value,
}

impl Request {
    pub fn to(target: impl Into<String>, op: MsgOp, payload: Value) -> Self {
        Self {
            envelope: Envelope::to(target),
            op,
            payload,
        }
    }
}

/// The outcome of a request: a status code, a human-readable note, and a
/// result payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub envelope: Envelope,
    pub ret_code: ReturnCode,
    pub return_msg: String,
    pub payload: Value,
}

impl Reply {
    /// Build the reply to `request`: addressed to its reply-to key, carrying
    /// its correlation id and encoding.
    pub fn to_request(
        request: &Request,
        ret_code: ReturnCode,
        return_msg: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut envelope = Envelope::to(request.envelope.reply_to.clone());
        envelope.corr_id = request.envelope.corr_id.clone();
        envelope.encoding = request.envelope.encoding;
        Self {
            envelope,
            ret_code,
            return_msg: return_msg.into(),
            payload,
        }
    }
}

/// A critical broadcast notification. No reply expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub envelope: Envelope,
    pub payload: Value,
}

impl Alert {
    pub fn to(target: impl Into<String>, payload: Value) -> Self {
        Self {
            envelope: Envelope::to(target),
            payload,
        }
    }
}

/// An informational broadcast notification. No reply expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub envelope: Envelope,
    pub payload: Value,
}

impl Info {
    pub fn to(target: impl Into<String>, payload: Value) -> Self {
        Self {
            envelope: Envelope::to(target),
            payload,
        }
    }
}

/// Tagged union over the four message kinds, for code that handles any of
/// them (the codec, the router's publish path).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Alert(Alert),
    Info(Info),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Request(_) => MsgType::Request,
            Message::Reply(_) => MsgType::Reply,
            Message::Alert(_) => MsgType::Alert,
            Message::Info(_) => MsgType::Info,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Message::Request(request) => &request.envelope,
            Message::Reply(reply) => &reply.envelope,
            Message::Alert(alert) => &alert.envelope,
            Message::Info(info) => &info.envelope,
        }
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Message::Request(request) => &mut request.envelope,
            Message::Reply(reply) => &mut reply.envelope,
            Message::Alert(alert) => &mut alert.envelope,
            Message::Info(info) => &mut info.envelope,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Message::Request(request) => &request.payload,
            Message::Reply(reply) => &reply.payload,
            Message::Alert(alert) => &alert.payload,
            Message::Info(info) => &info.payload,
        }
    }

    /// Resolve the exchange this message publishes to.
    ///
    /// Replies travel on the requests exchange: reply queues are bound there
    /// under their own generated name.
    pub fn exchange<'a>(&self, exchanges: &'a ExchangeConfig) -> &'a str {
        match self {
            Message::Request(_) | Message::Reply(_) => &exchanges.requests,
            Message::Alert(_) => &exchanges.alerts,
            Message::Info(_) => &exchanges.infos,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Reply> for Message {
    fn from(reply: Reply) -> Self {
        Message::Reply(reply)
    }
}

impl From<Alert> for Message {
    fn from(alert: Alert) -> Self {
        Message::Alert(alert)
    }
}

impl From<Info> for Message {
    fn from(info: Info) -> Self {
        Message::Info(info)
    }
}
