use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_bytes::ByteBuf;

use crate::{frame, ProtocolError};

/// Packaging of the workload code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Encoding {
    /// The bytes are the workload itself.
    Plain,
    /// A zip archive to extract.
    Zip,
    /// A filesystem image the host attached as a read-only volume at the code path.
    Squashfs,
    /// Anything else; rejected when the code is loaded.
    Unknown(String),
}

impl From<String> for Encoding {
    fn from(value: String) -> Self {
        match value.as_str() {
            "plain" => Encoding::Plain,
            "zip" => Encoding::Zip,
            "squashfs" => Encoding::Squashfs,
            _ => Encoding::Unknown(value),
        }
    }
}

impl From<Encoding> for String {
    fn from(value: Encoding) -> Self {
        match value {
            Encoding::Plain => "plain".into(),
            Encoding::Zip => "zip".into(),
            Encoding::Squashfs => "squashfs".into(),
            Encoding::Unknown(other) => other,
        }
    }
}

/// How the workload is driven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Interface {
    /// Loaded into the agent and called with a request scope (`"asgi"` on the wire).
    InProcess,
    /// Spawned as a process serving HTTP on [`crate::APP_PORT`].
    Executable,
    Unknown(String),
}

impl From<String> for Interface {
    fn from(value: String) -> Self {
        match value.as_str() {
            "asgi" => Interface::InProcess,
            "executable" => Interface::Executable,
            _ => Interface::Unknown(value),
        }
    }
}

impl From<Interface> for String {
    fn from(value: Interface) -> Self {
        match value {
            Interface::InProcess => "asgi".into(),
            Interface::Executable => "executable".into(),
            Interface::Unknown(other) => other,
        }
    }
}

/// Block device to mount during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Mount point inside the guest.
    pub mount: String,
    /// Device name under `/dev`.
    pub device: String,
    pub read_only: bool,
}

/// The one-time setup message describing the workload and its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationPayload {
    pub code: ByteBuf,
    pub encoding: Encoding,
    pub entrypoint: String,
    pub interface: Interface,
    #[serde(default)]
    pub input_data: Option<ByteBuf>,
    /// Identity of the VM: hostname and trusted sender address.
    pub vm_hash: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub dns_servers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub variables: Option<HashMap<String, String>>,
}

impl ConfigurationPayload {
    pub fn from_msgpack(data: &[u8]) -> Result<Self, ProtocolError> {
        frame::decode(data)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        frame::encode(self)
    }

    /// Input archive bytes, if any were supplied.
    pub fn input_bytes(&self) -> &[u8] {
        self.input_data.as_deref().map(|b| b.as_slice()).unwrap_or_default()
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Byte string that also accepts text or an array of small integers on
/// input. Always serialized as msgpack `bin`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&[u8]> for Blob {
    fn from(value: &[u8]) -> Self {
        Blob(value.to_vec())
    }
}

impl From<Vec<u8>> for Blob {
    fn from(value: Vec<u8>) -> Self {
        Blob(value)
    }
}

impl From<&str> for Blob {
    fn from(value: &str) -> Self {
        Blob(value.as_bytes().to_vec())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BlobVisitor;

        impl<'de> Visitor<'de> for BlobVisitor {
            type Value = Blob;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("bytes, a string or an array of bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Blob, E> {
                Ok(Blob(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Blob, E> {
                Ok(Blob(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Blob, E> {
                Ok(Blob(v.as_bytes().to_vec()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Blob, E> {
                Ok(Blob(v.into_bytes()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Blob, E> {
                Ok(Blob::default())
            }

            fn visit_none<E: de::Error>(self) -> Result<Blob, E> {
                Ok(Blob::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Blob, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(Blob(bytes))
            }
        }

        deserializer.deserialize_any(BlobVisitor)
    }
}

/// One inbound unit of work: an HTTP-like request description.
///
/// Fields the agent does not interpret are kept in `extra` and handed to
/// in-process applications untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query_string: Blob,
    #[serde(default)]
    pub headers: Vec<(Blob, Blob)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Blob>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, rmpv::Value>,
}

impl Scope {
    /// HTTP-shaped scopes answer with a headers message followed by a body message.
    pub fn is_http(&self) -> bool {
        self.kind == "http"
    }

    /// Event type delivered to the application's `receive`.
    pub fn request_event_type(&self) -> &'static str {
        match self.kind.as_str() {
            "http" | "websocket" => "http.request",
            _ => "aleph.message",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCodePayload {
    pub scope: Scope,
}

impl RunCodePayload {
    pub fn from_msgpack(data: &[u8]) -> Result<Self, ProtocolError> {
        frame::decode(data)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        frame::encode(self)
    }
}

/// Outcome of one run-code instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Success {
        /// Response start message (`{}` for non-HTTP scopes).
        headers: rmpv::Value,
        /// Response body message.
        body: rmpv::Value,
        /// Captured standard output of the call.
        output: String,
        /// Zip archive of the data directory, when the bridge produces one.
        output_data: Option<ByteBuf>,
    },
    Failure {
        error: String,
        traceback: String,
        output: Option<String>,
    },
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>, traceback: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            error: error.into(),
            traceback: traceback.into(),
            output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        frame::encode(self)
    }

    pub fn from_msgpack(data: &[u8]) -> Result<Self, ProtocolError> {
        frame::decode(data)
    }
}

/// Reply to the setup message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl SetupAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            traceback: None,
        }
    }

    pub fn failed(error: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            traceback: Some(traceback.into()),
        }
    }
}
