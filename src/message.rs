use zerocopy::AsBytes;

use crate::{
    id::{NodeId, Token},
    protocol::{
        self, kind, GroupNotifyCode, Header, JoinCode, LeaveCode, MessageKind, RegisterCode,
        SequenceNumber, SyncCode, SyncNotifyCode,
    },
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Body truncated: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid node id length: {0}")]
    InvalidNodeIdLength(i32),

    #[error("Node id is not valid UTF-8")]
    InvalidNodeIdEncoding,

    #[error("Invalid member count: {0}")]
    InvalidMemberCount(i32),

    #[error("Unknown {field} code: {value}")]
    UnknownCode { field: &'static str, value: i32 },

    #[error("Unknown message kind: {0}")]
    UnknownKind(MessageKind),

    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),
}

/// Big endian body writer.
#[derive(Debug, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn put_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Big endian body reader over a complete body.
#[derive(Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < count {
            return Err(DecodeError::Truncated {
                needed: count,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(count);
        self.bytes = tail;
        Ok(head)
    }

    pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.get_bytes(4)?);
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn get_i64(&mut self) -> Result<i64, DecodeError> {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(self.get_bytes(8)?);
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

/// A group of fields with a fixed wire encoding.
///
/// Messages are composed of these groups and encode them in declaration order.
pub trait WireFields: Sized {
    fn encoded_len(&self) -> usize;

    fn encode(&self, writer: &mut Writer);

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError>;
}

fn encode_code(writer: &mut Writer, code: impl Into<i32>) {
    writer.put_i32(code.into());
}

fn decode_code<C: TryFrom<i32, Error = i32>>(
    reader: &mut Reader,
    field: &'static str,
) -> Result<C, DecodeError> {
    C::try_from(reader.get_i32()?).map_err(|value| DecodeError::UnknownCode { field, value })
}

/// Identifies the group a message refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFields {
    pub group_id: NodeId,
    pub group_token: Token,
}

impl WireFields for GroupFields {
    fn encoded_len(&self) -> usize {
        self.group_id.encoded_len() + self.group_token.encoded_len()
    }

    fn encode(&self, writer: &mut Writer) {
        self.group_id.encode(writer);
        self.group_token.encode(writer);
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            group_id: NodeId::decode(reader)?,
            group_token: Token::decode(reader)?,
        })
    }
}

/// A list of members, encoded as a count followed by the node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList(pub Vec<NodeId>);

impl WireFields for MemberList {
    fn encoded_len(&self) -> usize {
        4 + self.0.iter().map(NodeId::encoded_len).sum::<usize>()
    }

    fn encode(&self, writer: &mut Writer) {
        writer.put_i32(self.0.len() as i32);
        for id in &self.0 {
            id.encode(writer);
        }
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        let count = reader.get_i32()?;
        // Every member needs at least 5 bytes, which bounds the allocation.
        let count = usize::try_from(count)
            .ok()
            .filter(|count| count * 5 <= reader.remaining())
            .ok_or(DecodeError::InvalidMemberCount(count))?;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(NodeId::decode(reader)?);
        }
        Ok(Self(members))
    }
}

/// Timeout and name of a sync point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFields {
    /// Timeout in milliseconds.
    pub timeout: i64,
    pub sync_point: NodeId,
}

impl WireFields for SyncFields {
    fn encoded_len(&self) -> usize {
        8 + self.sync_point.encoded_len()
    }

    fn encode(&self, writer: &mut Writer) {
        writer.put_i64(self.timeout);
        self.sync_point.encode(writer);
    }

    fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
        Ok(Self {
            timeout: reader.get_i64()?,
            sync_point: NodeId::decode(reader)?,
        })
    }
}

pub trait MessageKindData {
    fn kind() -> MessageKind;
}

macro_rules! impl_message_kind {
    ($kind:ident) => {
        paste::paste! {
            impl MessageKindData for $kind {
                fn kind() -> MessageKind {
                    kind::[< $kind:snake:upper >]
                }
            }
        }
    };
}

/// Declares a message body. Every body starts with the sender token followed by
/// the listed fields in order. Field types are either [`WireFields`] or wire
/// codes.
macro_rules! message {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($field:ident: $ty:ty => $codec:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub sender: Token,
            $(pub $field: $ty,)*
        }

        impl_message_kind!($name);

        impl WireFields for $name {
            fn encoded_len(&self) -> usize {
                self.sender.encoded_len() $(+ message!(@len $codec self.$field))*
            }

            fn encode(&self, writer: &mut Writer) {
                self.sender.encode(writer);
                $(message!(@encode $codec writer, self.$field);)*
            }

            fn decode(reader: &mut Reader) -> Result<Self, DecodeError> {
                Ok(Self {
                    sender: Token::decode(reader)?,
                    $($field: message!(@decode $codec reader, $ty, $field),)*
                })
            }
        }
    };

    (@len fields $value:expr) => { $value.encoded_len() };
    (@len code $value:expr) => { 4 };
    (@encode fields $writer:ident, $value:expr) => { $value.encode($writer) };
    (@encode code $writer:ident, $value:expr) => { encode_code($writer, $value) };
    (@decode fields $reader:ident, $ty:ty, $field:ident) => { <$ty>::decode($reader)? };
    (@decode code $reader:ident, $ty:ty, $field:ident) => {
        decode_code::<$ty>($reader, stringify!($field))?
    };
}

message!(RegisterRequest {
    client_id: NodeId => fields,
});

message!(RegisterResponse {
    client_token: Token => fields,
    code: RegisterCode => code,
});

message!(JoinRequest {
    group: GroupFields => fields,
});

message!(JoinResponse {
    group: GroupFields => fields,
    code: JoinCode => code,
});

message!(
    /// Membership change broadcast to all members of a group.
    GroupNotify {
        group: GroupFields => fields,
        members: MemberList => fields,
        code: GroupNotifyCode => code,
    }
);

message!(LeaveRequest {
    group: GroupFields => fields,
});

message!(LeaveResponse {
    group: GroupFields => fields,
    code: LeaveCode => code,
});

message!(SyncRequest {
    group: GroupFields => fields,
    sync: SyncFields => fields,
});

message!(
    /// Answer to a [`SyncRequest`]. `sync.timeout` holds the time left until
    /// the sync point times out.
    SyncResponse {
        group: GroupFields => fields,
        members: MemberList => fields,
        sync: SyncFields => fields,
        code: SyncCode => code,
    }
);

message!(
    /// Sync point progress or resolution sent to the participants of a sync
    /// point. `members` lists the participants that have arrived.
    SyncNotify {
        group: GroupFields => fields,
        members: MemberList => fields,
        sync_point: NodeId => fields,
        code: SyncNotifyCode => code,
    }
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Response,
    Notification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegisterRequest(RegisterRequest),
    RegisterResponse(RegisterResponse),
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    GroupNotify(GroupNotify),
    LeaveRequest(LeaveRequest),
    LeaveResponse(LeaveResponse),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    SyncNotify(SyncNotify),
}

macro_rules! for_each_message {
    ($self:expr, $message:ident => $body:expr) => {
        match $self {
            Message::RegisterRequest($message) => $body,
            Message::RegisterResponse($message) => $body,
            Message::JoinRequest($message) => $body,
            Message::JoinResponse($message) => $body,
            Message::GroupNotify($message) => $body,
            Message::LeaveRequest($message) => $body,
            Message::LeaveResponse($message) => $body,
            Message::SyncRequest($message) => $body,
            Message::SyncResponse($message) => $body,
            Message::SyncNotify($message) => $body,
        }
    };
}

fn kind_of<M: MessageKindData>(_: &M) -> MessageKind {
    M::kind()
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        for_each_message!(self, message => kind_of(message))
    }

    pub fn class(&self) -> MessageClass {
        match self {
            Message::RegisterRequest(_)
            | Message::JoinRequest(_)
            | Message::LeaveRequest(_)
            | Message::SyncRequest(_) => MessageClass::Request,
            Message::RegisterResponse(_)
            | Message::JoinResponse(_)
            | Message::LeaveResponse(_)
            | Message::SyncResponse(_) => MessageClass::Response,
            Message::GroupNotify(_) | Message::SyncNotify(_) => MessageClass::Notification,
        }
    }

    pub fn sender(&self) -> &Token {
        for_each_message!(self, message => &message.sender)
    }

    pub fn encoded_len(&self) -> usize {
        for_each_message!(self, message => message.encoded_len())
    }

    pub fn encode(&self, writer: &mut Writer) {
        for_each_message!(self, message => message.encode(writer))
    }

    /// Decodes a complete body of the given kind.
    pub fn decode(kind: MessageKind, body: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(body);
        let message = match kind {
            kind::REGISTER_REQUEST => Message::RegisterRequest(WireFields::decode(&mut reader)?),
            kind::REGISTER_RESPONSE => Message::RegisterResponse(WireFields::decode(&mut reader)?),
            kind::JOIN_REQUEST => Message::JoinRequest(WireFields::decode(&mut reader)?),
            kind::JOIN_RESPONSE => Message::JoinResponse(WireFields::decode(&mut reader)?),
            kind::GROUP_NOTIFY => Message::GroupNotify(WireFields::decode(&mut reader)?),
            kind::LEAVE_REQUEST => Message::LeaveRequest(WireFields::decode(&mut reader)?),
            kind::LEAVE_RESPONSE => Message::LeaveResponse(WireFields::decode(&mut reader)?),
            kind::SYNC_REQUEST => Message::SyncRequest(WireFields::decode(&mut reader)?),
            kind::SYNC_RESPONSE => Message::SyncResponse(WireFields::decode(&mut reader)?),
            kind::SYNC_NOTIFY => Message::SyncNotify(WireFields::decode(&mut reader)?),
            other => return Err(DecodeError::UnknownKind(other)),
        };
        match reader.remaining() {
            0 => Ok(message),
            trailing => Err(DecodeError::TrailingBytes(trailing)),
        }
    }
}

macro_rules! impl_from_message {
    ($($kind:ident),+) => {
        $(
            impl From<$kind> for Message {
                fn from(message: $kind) -> Self {
                    Message::$kind(message)
                }
            }
        )+
    };
}

impl_from_message!(
    RegisterRequest,
    RegisterResponse,
    JoinRequest,
    JoinResponse,
    GroupNotify,
    LeaveRequest,
    LeaveResponse,
    SyncRequest,
    SyncResponse,
    SyncNotify
);

/// A message together with its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub message: Message,

    /// For received responses, the request this response answers.
    pub request: Option<Box<Message>>,
}

impl Packet {
    /// Creates a packet with a newly drawn sequence number.
    pub fn new(message: impl Into<Message>) -> Self {
        let message = message.into();
        let kind = message.kind();
        Self {
            header: Header::new(
                kind,
                protocol::next_sequence_number(kind),
                message.encoded_len(),
            ),
            message,
            request: None,
        }
    }

    /// Creates a packet answering `request`, reusing its sequence number.
    pub fn response_to(request: &Packet, message: impl Into<Message>) -> Self {
        let message = message.into();
        Self {
            header: Header::new(message.kind(), request.seq(), message.encoded_len()),
            message,
            request: None,
        }
    }

    /// Creates a packet from a received header and its complete body.
    pub fn from_parts(header: Header, body: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            message: Message::decode(header.kind(), body)?,
            header,
            request: None,
        })
    }

    pub fn seq(&self) -> SequenceNumber {
        self.header.seq()
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind()
    }

    pub fn class(&self) -> MessageClass {
        self.message.class()
    }

    /// Size of the encoded packet including the header.
    pub fn encoded_len(&self) -> usize {
        protocol::HEADER_SIZE + self.message.encoded_len()
    }

    /// Appends the encoded packet to `out`.
    ///
    /// The length field is recomputed from the message. Packets larger than
    /// [`MAX_PACKET_SIZE`](protocol::MAX_PACKET_SIZE) are rejected by every
    /// receiver and must not be encoded.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        debug_assert!(self.encoded_len() <= protocol::MAX_PACKET_SIZE);
        let mut header = self.header;
        header.total_length = (self.encoded_len() as i32).into();
        out.extend_from_slice(header.as_bytes());
        let mut writer = Writer::with_capacity(self.message.encoded_len());
        self.message.encode(&mut writer);
        out.extend_from_slice(&writer.into_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}
