use std::sync::Mutex;

use rand::Rng;
use zerocopy::{byteorder::network_endian::I32, AsBytes, FromBytes, FromZeroes, Unaligned};

pub type MessageKind = i32;
pub type SequenceNumber = i32;

pub const PROTOCOL_VERSION_1: i32 = 1;

/// Size of a [`Token`](crate::Token) on the wire (SHA-256 output size).
pub const TOKEN_SIZE: usize = 32;

/// Maximum size of an encoded [`NodeId`](crate::NodeId) in bytes.
pub const NODE_ID_MAX_SIZE: usize = 32;

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Upper bound for `total_length`. Anything larger is treated as a corrupt
/// stream as the length cannot be trusted to skip the body.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Encoded size of the longest [`NodeId`](crate::NodeId): length and bytes.
pub const NODE_ID_MAX_ENCODED_SIZE: usize = 4 + NODE_ID_MAX_SIZE;

/// Largest member list that fits into every message carrying one.
///
/// The sync response is the largest of them: sender, group id and token,
/// member count, timeout, sync point id and code around the list.
pub const MAX_GROUP_SIZE: usize = (MAX_PACKET_SIZE
    - HEADER_SIZE
    - TOKEN_SIZE
    - NODE_ID_MAX_ENCODED_SIZE
    - TOKEN_SIZE
    - 4
    - 8
    - NODE_ID_MAX_ENCODED_SIZE
    - 4)
    / NODE_ID_MAX_ENCODED_SIZE;

pub mod kind {
    use super::MessageKind;

    pub const REGISTER_REQUEST: MessageKind = 1;
    pub const REGISTER_RESPONSE: MessageKind = 2;
    pub const JOIN_REQUEST: MessageKind = 3;
    pub const JOIN_RESPONSE: MessageKind = 4;
    pub const GROUP_NOTIFY: MessageKind = 5;
    pub const LEAVE_REQUEST: MessageKind = 6;
    pub const LEAVE_RESPONSE: MessageKind = 7;
    pub const SYNC_REQUEST: MessageKind = 8;
    pub const SYNC_RESPONSE: MessageKind = 9;
    pub const SYNC_NOTIFY: MessageKind = 10;

    pub const COUNT: usize = 10;
}

/// The fixed packet header.
///
/// `total_length` includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Header {
    pub protocol_version: I32,
    pub total_length: I32,
    pub sequence_number: I32,
    pub message_kind: I32,
}

impl Header {
    pub fn new(kind: MessageKind, sequence_number: SequenceNumber, body_length: usize) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_1.into(),
            total_length: ((HEADER_SIZE + body_length) as i32).into(),
            sequence_number: sequence_number.into(),
            message_kind: kind.into(),
        }
    }

    /// Parses a header from the start of `bytes` if enough bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes)
    }

    pub fn kind(&self) -> MessageKind {
        self.message_kind.get()
    }

    pub fn seq(&self) -> SequenceNumber {
        self.sequence_number.get()
    }

    pub fn version(&self) -> i32 {
        self.protocol_version.get()
    }

    /// Length of the body following the header, or `None` if `total_length`
    /// is out of bounds.
    pub fn body_length(&self) -> Option<usize> {
        let total = usize::try_from(self.total_length.get()).ok()?;
        if total < HEADER_SIZE || total > MAX_PACKET_SIZE {
            None
        } else {
            Some(total - HEADER_SIZE)
        }
    }

    pub fn is_supported_version(&self) -> bool {
        self.version() == PROTOCOL_VERSION_1
    }
}

/// Returned when no sequence number different from the previous one could be
/// drawn for a kind.
pub const SEQ_UPDATE_FAIL_RANDOM: SequenceNumber = -1;

/// Returned for kinds outside of the known range.
pub const SEQ_UPDATE_FAIL_NO_GENERATOR: SequenceNumber = -2;

const SEQ_START: SequenceNumber = 1000;
const SEQ_RANGE: SequenceNumber = 100;
const SEQ_GAP: SequenceNumber = 100;
const SEQ_MAX_ROUNDS: usize = 20;

/// Sequence number range `[min, max)` used for the given message kind.
pub fn sequence_range(kind: MessageKind) -> Option<(SequenceNumber, SequenceNumber)> {
    if !(1..=kind::COUNT as MessageKind).contains(&kind) {
        return None;
    }
    let min = SEQ_START + (kind - 1) * (SEQ_RANGE + SEQ_GAP);
    Some((min, min + SEQ_RANGE))
}

static LAST_SEQUENCE_NUMBERS: Mutex<[Option<SequenceNumber>; kind::COUNT]> =
    Mutex::new([None; kind::COUNT]);

/// Draws a new sequence number for a freshly created packet of `kind`.
pub fn next_sequence_number(kind: MessageKind) -> SequenceNumber {
    let Some((min, max)) = sequence_range(kind) else {
        return SEQ_UPDATE_FAIL_NO_GENERATOR;
    };

    let mut last = match LAST_SEQUENCE_NUMBERS.lock() {
        Ok(last) => last,
        Err(poisoned) => poisoned.into_inner(),
    };
    let last = &mut last[(kind - 1) as usize];

    let mut rng = rand::thread_rng();
    for _ in 0..SEQ_MAX_ROUNDS {
        let next = rng.gen_range(min..max);
        if Some(next) != *last {
            *last = Some(next);
            return next;
        }
    }

    SEQ_UPDATE_FAIL_RANDOM
}

/// Declares a wire result code enum encoded as an `int32`.
macro_rules! wire_code {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),+
        }

        impl From<$name> for i32 {
            fn from(code: $name) -> i32 {
                code as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = i32;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(other),
                }
            }
        }
    };
}

wire_code!(
    /// Result of a registration attempt.
    RegisterCode {
        Accepted = 0,
        ServerFull = 1,
        AuthenticationFailure = 2,
    }
);

wire_code!(
    /// Result of a group join attempt.
    JoinCode {
        Accepted = 0,
        GroupFull = 1,
        AuthenticationFailure = 2,
    }
);

wire_code!(LeaveCode { Accepted = 0 });

wire_code!(
    /// Reason for a group membership notification.
    GroupNotifyCode {
        Join = 0,
        Leave = 1,
        Close = 2,
    }
);

wire_code!(
    /// Server side status of a sync request.
    SyncCode {
        Created = 0,
        Joined = 1,
        Expired = 2,
        AuthenticationFailure = 3,
    }
);

wire_code!(
    /// Reason for a sync point notification.
    SyncNotifyCode {
        Success = 0,
        Join = 1,
        Leave = 2,
        Timeout = 3,
        Close = 4,
    }
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn group_size_limit_leaves_room_for_sync_response() {
        assert_eq!(NODE_ID_MAX_ENCODED_SIZE, 36);
        assert_eq!(MAX_GROUP_SIZE, 1815);
    }

    #[test]
    fn header_is_four_ints() {
        assert_eq!(HEADER_SIZE, 16);

        let header = Header::new(kind::SYNC_NOTIFY, 1234, 10);
        assert_eq!(
            header.as_bytes(),
            &[0, 0, 0, 1, 0, 0, 0, 26, 0, 0, 4, 210, 0, 0, 0, 10]
        );
        assert_eq!(Header::parse(header.as_bytes()), Some(header));
        assert_eq!(Header::parse(&header.as_bytes()[..15]), None);
    }

    #[test]
    fn body_length_bounds() {
        let mut header = Header::new(kind::JOIN_REQUEST, 0, 0);
        assert_eq!(header.body_length(), Some(0));

        header.total_length = 15.into();
        assert_eq!(header.body_length(), None);

        header.total_length = (MAX_PACKET_SIZE as i32 + 1).into();
        assert_eq!(header.body_length(), None);

        header.total_length = (-4).into();
        assert_eq!(header.body_length(), None);
    }

    #[test]
    fn sequence_ranges_are_disjoint_and_gapped() {
        let ranges = (1..=kind::COUNT as MessageKind)
            .map(|k| sequence_range(k).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ranges[0], (1000, 1100));
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].0 - pair[0].1, SEQ_GAP);
        }
        assert_eq!(sequence_range(0), None);
        assert_eq!(sequence_range(11), None);
    }

    #[test]
    fn sequence_numbers_stay_in_range() {
        let (min, max) = sequence_range(kind::SYNC_REQUEST).unwrap();
        for _ in 0..200 {
            let seq = next_sequence_number(kind::SYNC_REQUEST);
            assert!((min..max).contains(&seq), "{seq} not in [{min}, {max})");
        }
        assert_eq!(next_sequence_number(42), SEQ_UPDATE_FAIL_NO_GENERATOR);
    }

    #[test]
    fn codes_round_trip_through_i32() {
        assert_eq!(SyncNotifyCode::try_from(4), Ok(SyncNotifyCode::Close));
        assert_eq!(i32::from(SyncCode::AuthenticationFailure), 3);
        assert_eq!(JoinCode::try_from(7), Err(7));
    }
}
