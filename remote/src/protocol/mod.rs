//! Replication wire protocol.
//!
//! Both fabrics carry the same frame: `[address, command, payload]`. On the
//! wire each frame is one length-delimited message whose body is
//!
//! ```text
//! | addr_len: u16 BE | address (UTF-8) | cmd_len: u8 | command (UTF-8) | payload ... |
//! ```
//!
//! [`RawFrame`] only looks at the header, so the broker can route and relay a
//! data chunk without touching its payload. Endpoints decode the payload into a
//! typed [`Message`].

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Longest session address we accept (fits the u16 length prefix with room to spare).
pub const MAX_ADDRESS_LEN: usize = 1024;

/// Closed vocabulary of frame commands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::IntoStaticStr,
)]
pub enum Command {
    #[strum(serialize = "sender-ready")]
    SenderReady,
    #[strum(serialize = "receiver-ready")]
    ReceiverReady,
    #[strum(serialize = "receiver-error")]
    ReceiverError,
    #[strum(serialize = "receiver-init-error")]
    ReceiverInitError,
    #[strum(serialize = "send-more")]
    SendMore,
    /// raw snapshot stream chunk
    #[strum(serialize = "")]
    Data,
    #[strum(serialize = "snap-exists")]
    SnapExists,
    #[strum(serialize = "btrfs-send-init-error")]
    SendInitError,
    #[strum(serialize = "btrfs-send-unexpected-termination-error")]
    SendUnexpectedTermination,
    #[strum(serialize = "btrfs-send-nonzero-termination-error")]
    SendNonzeroTermination,
    #[strum(serialize = "btrfs-send-stream-finished")]
    SendStreamFinished,
    #[strum(serialize = "btrfs-recv-finished")]
    RecvFinished,
    #[strum(serialize = "new-send")]
    NewSend,
    #[strum(serialize = "SUCCESS")]
    Success,
    #[strum(serialize = "ERROR")]
    Error,
    #[strum(serialize = "ACK")]
    Ack,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Command::iter().find(|command| command.as_str() == s)
    }

    /// Commands a local Receiver sends that the broker acknowledges before relaying them.
    pub fn needs_ack(&self) -> bool {
        matches!(
            self,
            Command::ReceiverReady
                | Command::ReceiverError
                | Command::SnapExists
                | Command::RecvFinished
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Data => write!(f, "<data>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("frame address is not valid UTF-8")]
    BadAddress,
    #[error("frame address is {0} bytes, at most {MAX_ADDRESS_LEN} allowed")]
    AddressTooLong(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed {command} payload: {reason}")]
    Payload { command: Command, reason: String },
}

/// First message of every transfer, sent by the Sender to the remote broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// destination pool the mirror share lives in
    pub pool: String,
    /// source share name, the receiver derives its mirror share from it
    pub share: String,
    /// snapshot being transferred
    pub snap: String,
    pub incremental: bool,
    /// source appliance identity
    pub uuid: String,
    /// protocol version of the sender
    pub version: String,
}

impl Greeting {
    /// Greeting stamped with this build's protocol version.
    pub fn new(pool: &str, share: &str, snap: &str, incremental: bool, uuid: &str) -> Self {
        Self {
            pool: pool.to_string(),
            share: share.to_string(),
            snap: snap.to_string(),
            incremental,
            uuid: uuid.to_string(),
            version: common::version::ProtocolVersion::current().semantic,
        }
    }

    pub fn is_compatible(&self) -> bool {
        common::version::ProtocolVersion::current().is_compatible_with_semantic(&self.version)
    }

    /// Checks that every name the receiver turns into a path is a single path component.
    pub fn validate(&self) -> Result<(), String> {
        for (field, name) in [
            ("pool", &self.pool),
            ("share", &self.share),
            ("snap", &self.snap),
            ("uuid", &self.uuid),
        ] {
            if !is_path_component(name) {
                return Err(format!("{field} {name:?} is not a valid name"));
            }
        }
        Ok(())
    }
}

fn is_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Payload of `receiver-ready`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverReady {
    /// newest snapshot the receiver holds for this share, if any
    pub latest_snapshot: Option<String>,
}

/// A frame decoded into its typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SenderReady(Greeting),
    ReceiverReady(ReceiverReady),
    ReceiverError(String),
    ReceiverInitError(String),
    SendMore,
    Data(bytes::Bytes),
    SnapExists(String),
    SendInitError(String),
    SendUnexpectedTermination(String),
    SendNonzeroTermination(String),
    SendStreamFinished,
    RecvFinished,
    NewSend(u64),
    Success(String),
    Error(String),
    Ack,
}

fn text_payload(command: Command, payload: &bytes::Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(payload.to_vec()).map_err(|e| ProtocolError::Payload {
        command,
        reason: e.to_string(),
    })
}

fn json_payload<T: serde::de::DeserializeOwned>(
    command: Command,
    payload: &bytes::Bytes,
) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Payload {
        command,
        reason: e.to_string(),
    })
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::SenderReady(_) => Command::SenderReady,
            Message::ReceiverReady(_) => Command::ReceiverReady,
            Message::ReceiverError(_) => Command::ReceiverError,
            Message::ReceiverInitError(_) => Command::ReceiverInitError,
            Message::SendMore => Command::SendMore,
            Message::Data(_) => Command::Data,
            Message::SnapExists(_) => Command::SnapExists,
            Message::SendInitError(_) => Command::SendInitError,
            Message::SendUnexpectedTermination(_) => Command::SendUnexpectedTermination,
            Message::SendNonzeroTermination(_) => Command::SendNonzeroTermination,
            Message::SendStreamFinished => Command::SendStreamFinished,
            Message::RecvFinished => Command::RecvFinished,
            Message::NewSend(_) => Command::NewSend,
            Message::Success(_) => Command::Success,
            Message::Error(_) => Command::Error,
            Message::Ack => Command::Ack,
        }
    }

    pub fn payload(&self) -> bytes::Bytes {
        match self {
            // serializing plain structs of strings cannot fail
            Message::SenderReady(greeting) => {
                bytes::Bytes::from(serde_json::to_vec(greeting).unwrap_or_default())
            }
            Message::ReceiverReady(ready) => {
                bytes::Bytes::from(serde_json::to_vec(ready).unwrap_or_default())
            }
            Message::Data(chunk) => chunk.clone(),
            Message::NewSend(id) => bytes::Bytes::from(id.to_string()),
            Message::ReceiverError(text)
            | Message::ReceiverInitError(text)
            | Message::SnapExists(text)
            | Message::SendInitError(text)
            | Message::SendUnexpectedTermination(text)
            | Message::SendNonzeroTermination(text)
            | Message::Success(text)
            | Message::Error(text) => bytes::Bytes::from(text.clone().into_bytes()),
            Message::SendMore
            | Message::SendStreamFinished
            | Message::RecvFinished
            | Message::Ack => bytes::Bytes::new(),
        }
    }

    pub fn decode(command: Command, payload: bytes::Bytes) -> Result<Self, ProtocolError> {
        let message = match command {
            Command::SenderReady => {
                let greeting: Greeting = json_payload(command, &payload)?;
                greeting
                    .validate()
                    .map_err(|reason| ProtocolError::Payload { command, reason })?;
                Message::SenderReady(greeting)
            }
            Command::ReceiverReady => {
                // an empty payload is a receiver without snapshot knowledge
                if payload.is_empty() {
                    Message::ReceiverReady(ReceiverReady::default())
                } else {
                    Message::ReceiverReady(json_payload(command, &payload)?)
                }
            }
            Command::ReceiverError => Message::ReceiverError(text_payload(command, &payload)?),
            Command::ReceiverInitError => {
                Message::ReceiverInitError(text_payload(command, &payload)?)
            }
            Command::SendMore => Message::SendMore,
            Command::Data => Message::Data(payload),
            Command::SnapExists => Message::SnapExists(text_payload(command, &payload)?),
            Command::SendInitError => Message::SendInitError(text_payload(command, &payload)?),
            Command::SendUnexpectedTermination => {
                Message::SendUnexpectedTermination(text_payload(command, &payload)?)
            }
            Command::SendNonzeroTermination => {
                Message::SendNonzeroTermination(text_payload(command, &payload)?)
            }
            Command::SendStreamFinished => Message::SendStreamFinished,
            Command::RecvFinished => Message::RecvFinished,
            Command::NewSend => {
                let text = text_payload(command, &payload)?;
                let id = text.trim().parse().map_err(|e| ProtocolError::Payload {
                    command,
                    reason: format!("{text:?} is not a replica id: {e}"),
                })?;
                Message::NewSend(id)
            }
            Command::Success => Message::Success(text_payload(command, &payload)?),
            Command::Error => Message::Error(text_payload(command, &payload)?),
            Command::Ack => Message::Ack,
        };
        Ok(message)
    }
}

/// A frame as it travels on the wire, header parsed, payload untouched.
#[derive(Debug, Clone)]
pub struct RawFrame {
    buf: bytes::Bytes,
    address: String,
    command: Command,
    payload_offset: usize,
}

impl RawFrame {
    pub fn new(address: &str, message: &Message) -> Result<Self, ProtocolError> {
        let command = message.command();
        let payload = message.payload();
        let address_len = address.len();
        if address_len > MAX_ADDRESS_LEN {
            return Err(ProtocolError::AddressTooLong(address_len));
        }
        let command_str = command.as_str();
        let mut buf =
            bytes::BytesMut::with_capacity(3 + address_len + command_str.len() + payload.len());
        bytes::BufMut::put_u16(&mut buf, address_len as u16);
        bytes::BufMut::put_slice(&mut buf, address.as_bytes());
        bytes::BufMut::put_u8(&mut buf, command_str.len() as u8);
        bytes::BufMut::put_slice(&mut buf, command_str.as_bytes());
        let payload_offset = buf.len();
        bytes::BufMut::put_slice(&mut buf, &payload);
        Ok(Self {
            buf: buf.freeze(),
            address: address.to_string(),
            command,
            payload_offset,
        })
    }

    /// Reads the header of a received frame.
    pub fn parse(buf: bytes::Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < 2 {
            return Err(ProtocolError::Truncated("address length"));
        }
        let address_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if address_len > MAX_ADDRESS_LEN {
            return Err(ProtocolError::AddressTooLong(address_len));
        }
        let address_end = 2 + address_len;
        if buf.len() < address_end + 1 {
            return Err(ProtocolError::Truncated("address"));
        }
        let address = std::str::from_utf8(&buf[2..address_end])
            .map_err(|_| ProtocolError::BadAddress)?
            .to_string();
        let command_len = buf[address_end] as usize;
        let command_end = address_end + 1 + command_len;
        if buf.len() < command_end {
            return Err(ProtocolError::Truncated("command"));
        }
        let command_str = String::from_utf8_lossy(&buf[address_end + 1..command_end]);
        let command = Command::parse(&command_str)
            .ok_or_else(|| ProtocolError::UnknownCommand(command_str.to_string()))?;
        Ok(Self {
            buf,
            address,
            command,
            payload_offset: command_end,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.payload_offset
    }

    /// Zero-copy view of the payload.
    pub fn payload(&self) -> bytes::Bytes {
        self.buf.slice(self.payload_offset..)
    }

    pub fn message(&self) -> Result<Message, ProtocolError> {
        Message::decode(self.command, self.payload())
    }

    /// The full encoded frame, ready to be written to another stream unchanged.
    pub fn as_bytes(&self) -> &bytes::Bytes {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Session address of the transfer for `replica_id` originating at `appliance_id`.
pub fn sender_address(appliance_id: &str, replica_id: u64) -> String {
    format!("{appliance_id}-{replica_id}")
}
