use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipeError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    OneWay,
    TwoWay,
    ConfigOneWay,
    ConfigTwoWay,
    Reply,
    Ack,
    Other(String),
}

impl MessageType {
    #[inline]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::OneWay => "oneway",
            MessageType::TwoWay => "twoway",
            MessageType::ConfigOneWay => "config-oneway",
            MessageType::ConfigTwoWay => "config-twoway",
            MessageType::Reply => "reply",
            MessageType::Ack => "ack",
            MessageType::Other(t) => t.as_str(),
        }
    }

    /// Types whose sender waits for a reply.
    #[inline]
    pub fn is_twoway(&self) -> bool {
        matches!(self, MessageType::TwoWay | MessageType::ConfigTwoWay)
    }

    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, MessageType::ConfigOneWay | MessageType::ConfigTwoWay)
    }
}

impl FromStr for MessageType {
    type Err = PipeError;

    /// Short names used by older clients (`1w`, `2w`, `c`, `r`, ...) are accepted and
    /// mapped onto the canonical vocabulary.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "oneway" | "1w" => MessageType::OneWay,
            "twoway" | "2w" => MessageType::TwoWay,
            "config-oneway" | "1w-c" => MessageType::ConfigOneWay,
            "config-twoway" | "2w-c" | "c" => MessageType::ConfigTwoWay,
            "reply" | "r" => MessageType::Reply,
            "ack" => MessageType::Ack,
            "" => return Err(PipeError::BadRequest("missing msg type".into())),
            other => MessageType::Other(other.into()),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        MessageType::from_str(&String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }
}

/// The envelope exchanged between publishers and subscribers.
///
/// A message is built with the chained setters below, then handed to the router, after which
/// it is shared as `Arc<Message>` and no longer changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Message::ver_default")]
    pub ver: u32,
    #[serde(rename = "type")]
    pub typ: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint: Option<String>,
    #[serde(default)]
    pub subj: String,
    #[serde(default)]
    pub targ: Vec<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub auth: Value,
}

impl Message {
    #[inline]
    fn ver_default() -> u32 {
        1
    }

    pub fn new(typ: MessageType) -> Self {
        Message {
            ver: Self::ver_default(),
            typ,
            tint: None,
            subj: String::new(),
            targ: Vec::new(),
            body: Value::Null,
            headers: HashMap::default(),
            cookies: HashMap::default(),
            meta: Value::Null,
            auth: Value::Null,
        }
    }

    #[inline]
    pub fn oneway() -> Self {
        Self::new(MessageType::OneWay)
    }

    #[inline]
    pub fn twoway() -> Self {
        Self::new(MessageType::TwoWay)
    }

    /// A reply correlated with `original` by tint.
    pub fn reply(original: &Message) -> Self {
        let mut m = Self::new(MessageType::Reply);
        m.tint.clone_from(&original.tint);
        m.subj.clone_from(&original.subj);
        m
    }

    /// Acknowledges a one-way send or a reply.
    pub fn ack(original: &Message) -> Self {
        let mut m = Self::new(MessageType::Ack);
        m.tint.clone_from(&original.tint);
        m.subj.clone_from(&original.subj);
        m.body = Value::String("ACK".into());
        m
    }

    #[inline]
    pub fn tint<T: Into<String>>(mut self, tint: T) -> Self {
        self.tint = Some(tint.into());
        self
    }

    #[inline]
    pub fn subject<S: Into<String>>(mut self, subj: S) -> Self {
        self.subj = subj.into();
        self
    }

    #[inline]
    pub fn target<T: Into<String>>(mut self, target: T) -> Self {
        self.targ.push(target.into());
        self
    }

    #[inline]
    pub fn targets<I, T>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.targ = targets.into_iter().map(Into::into).collect();
        self
    }

    #[inline]
    pub fn body<B: Into<Value>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    #[inline]
    pub fn header<K: Into<String>, V: Into<String>>(mut self, k: K, v: V) -> Self {
        self.headers.insert(k.into(), v.into());
        self
    }

    #[inline]
    pub fn meta<M: Into<Value>>(mut self, meta: M) -> Self {
        self.meta = meta.into();
        self
    }

    #[inline]
    pub fn auth<A: Into<Value>>(mut self, auth: A) -> Self {
        self.auth = auth.into();
        self
    }

    #[inline]
    pub fn set_tint(&mut self, tint: &str) {
        self.tint = Some(tint.to_owned());
    }

    #[inline]
    pub fn set_cookies(&mut self, cookies: &HashMap<String, String>) {
        self.cookies.clone_from(cookies);
    }

    #[inline]
    pub fn tint_str(&self) -> &str {
        self.tint.as_deref().unwrap_or_default()
    }

    #[inline]
    pub fn to_json(&self) -> Result<String, PipeError> {
        Ok(serde_json::to_string(self)?)
    }

    #[inline]
    pub fn from_json(data: &str) -> Result<Self, PipeError> {
        Ok(serde_json::from_str(data)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {{{}}}", self.typ, self.subj, self.targ.join(", "))
    }
}
