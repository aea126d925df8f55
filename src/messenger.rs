use std::io::{self, Read, Write};

use ahash::HashMap;

use crate::{
    message::{
        GroupNotify, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Message,
        MessageClass, Packet, RegisterRequest, RegisterResponse, SyncNotify, SyncRequest,
        SyncResponse,
    },
    protocol::{self, Header, SequenceNumber, HEADER_SIZE},
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Tells the reactor whether a connection should be drained further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadResult {
    /// Data was read, the stream may have more.
    MoreAvailable,
    /// The stream has no more data for now.
    Exhausted,
    /// The peer closed the connection.
    PeerClosed,
}

#[derive(Debug, Clone, Copy)]
enum ParseState {
    ReadingHeader,
    ReadingData(Header),
}

/// Turns a non-blocking byte stream into packets and back.
///
/// Requests sent through the messenger are remembered by sequence number until
/// their response arrives or they are cancelled. Responses without a matching
/// request are dropped.
pub(crate) struct Messenger<S> {
    stream: S,
    input: Vec<u8>,
    output: Vec<u8>,
    state: ParseState,
    pending: HashMap<SequenceNumber, Message>,
    sent: u64,
}

impl<S: Read + Write> Messenger<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            input: Vec::with_capacity(READ_CHUNK_SIZE),
            output: Vec::new(),
            state: ParseState::ReadingHeader,
            pending: HashMap::default(),
            sent: 0,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Performs a single read from the stream and appends every packet that
    /// became complete to `packets`.
    ///
    /// An error is returned if the stream fails or if the peer sends a length
    /// that cannot be trusted. In both cases the connection should be closed.
    pub fn read(&mut self, packets: &mut Vec<Packet>) -> io::Result<ReadResult> {
        let start = self.input.len();
        self.input.resize(start + READ_CHUNK_SIZE, 0);
        let result = loop {
            match self.stream.read(&mut self.input[start..]) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => break result,
            }
        };

        match result {
            Ok(0) => {
                self.input.truncate(start);
                Ok(ReadResult::PeerClosed)
            }
            Ok(n) => {
                self.input.truncate(start + n);
                self.parse(packets)?;
                Ok(ReadResult::MoreAvailable)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.input.truncate(start);
                Ok(ReadResult::Exhausted)
            }
            Err(err) => {
                self.input.truncate(start);
                Err(err)
            }
        }
    }

    fn parse(&mut self, packets: &mut Vec<Packet>) -> io::Result<()> {
        let mut position = 0;

        loop {
            let available = &self.input[position..];
            match self.state {
                ParseState::ReadingHeader => {
                    let Some(header) = Header::parse(available) else {
                        break;
                    };
                    if header.body_length().is_none() {
                        tracing::warn!(
                            total_length = header.total_length.get(),
                            "invalid packet length"
                        );
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid packet length",
                        ));
                    }
                    position += HEADER_SIZE;
                    self.state = ParseState::ReadingData(header);
                }
                ParseState::ReadingData(header) => {
                    let length = header.body_length().unwrap_or_default();
                    if available.len() < length {
                        break;
                    }
                    let body = &available[..length];
                    position += length;
                    self.state = ParseState::ReadingHeader;

                    if let Some(packet) = Self::decode(header, body) {
                        if let Some(packet) = self.correlate(packet) {
                            packets.push(packet);
                        }
                    }
                }
            }
        }

        self.input.drain(..position);
        Ok(())
    }

    fn decode(header: Header, body: &[u8]) -> Option<Packet> {
        if !header.is_supported_version() {
            tracing::debug!(
                version = header.version(),
                kind = header.kind(),
                "dropping packet with unsupported protocol version"
            );
            return None;
        }
        if protocol::sequence_range(header.kind()).is_none() {
            tracing::debug!(kind = header.kind(), "dropping packet of unknown kind");
            return None;
        }

        match Packet::from_parts(header, body) {
            Ok(packet) => Some(packet),
            Err(err) => {
                tracing::warn!(
                    kind = header.kind(),
                    seq = header.seq(),
                    %err,
                    "dropping malformed packet"
                );
                None
            }
        }
    }

    fn correlate(&mut self, mut packet: Packet) -> Option<Packet> {
        if packet.class() != MessageClass::Response {
            return Some(packet);
        }
        match self.pending.remove(&packet.seq()) {
            Some(request) => {
                packet.request = Some(Box::new(request));
                Some(packet)
            }
            None => {
                tracing::debug!(
                    kind = packet.kind(),
                    seq = packet.seq(),
                    "dropping response without outstanding request"
                );
                None
            }
        }
    }

    /// Queues the packet and writes as much of the queued output as possible.
    ///
    /// Requests are recorded so that their response can be matched. A packet
    /// larger than [`protocol::MAX_PACKET_SIZE`] is refused with
    /// [`io::ErrorKind::InvalidInput`] and nothing is queued.
    pub fn send(&mut self, packet: &Packet) -> io::Result<()> {
        if packet.encoded_len() > protocol::MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet exceeds maximum size",
            ));
        }
        if packet.class() == MessageClass::Request {
            self.pending.insert(packet.seq(), packet.message.clone());
        }
        packet.encode_into(&mut self.output);
        self.sent += 1;
        tracing::trace!(kind = packet.kind(), seq = packet.seq(), "send packet");

        self.flush().map_err(|err| {
            self.pending.remove(&packet.seq());
            err
        })
    }

    /// Writes queued output until the stream would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()
    }

    /// Number of packets queued by [`Self::send`].
    pub fn packets_sent(&self) -> u64 {
        self.sent
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Forgets an outstanding request so that a late response is dropped.
    pub fn cancel(&mut self, seq: SequenceNumber) -> bool {
        self.pending.remove(&seq).is_some()
    }

    pub fn is_pending(&self, seq: SequenceNumber) -> bool {
        self.pending.contains_key(&seq)
    }
}

fn unhandled(packet: &Packet) {
    tracing::debug!(
        kind = packet.kind(),
        seq = packet.seq(),
        "no handler for packet"
    );
}

/// Receives decoded packets by kind.
///
/// Responses are passed together with the request they answer. Every method
/// defaults to logging and dropping the packet.
pub(crate) trait PacketHandler {
    #[allow(unused_variables)]
    fn register_request(&mut self, packet: &Packet, request: &RegisterRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn register_response(
        &mut self,
        packet: &Packet,
        response: &RegisterResponse,
        request: &RegisterRequest,
    ) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn join_request(&mut self, packet: &Packet, request: &JoinRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn join_response(&mut self, packet: &Packet, response: &JoinResponse, request: &JoinRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn group_notify(&mut self, packet: &Packet, notify: &GroupNotify) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn leave_request(&mut self, packet: &Packet, request: &LeaveRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn leave_response(
        &mut self,
        packet: &Packet,
        response: &LeaveResponse,
        request: &LeaveRequest,
    ) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn sync_request(&mut self, packet: &Packet, request: &SyncRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn sync_response(&mut self, packet: &Packet, response: &SyncResponse, request: &SyncRequest) {
        unhandled(packet)
    }

    #[allow(unused_variables)]
    fn sync_notify(&mut self, packet: &Packet, notify: &SyncNotify) {
        unhandled(packet)
    }
}

/// Calls the handler method matching the packet's message kind.
pub(crate) fn dispatch<H: PacketHandler + ?Sized>(handler: &mut H, packet: &Packet) {
    match (&packet.message, packet.request.as_deref()) {
        (Message::RegisterRequest(request), _) => handler.register_request(packet, request),
        (Message::JoinRequest(request), _) => handler.join_request(packet, request),
        (Message::LeaveRequest(request), _) => handler.leave_request(packet, request),
        (Message::SyncRequest(request), _) => handler.sync_request(packet, request),
        (Message::GroupNotify(notify), _) => handler.group_notify(packet, notify),
        (Message::SyncNotify(notify), _) => handler.sync_notify(packet, notify),
        (Message::RegisterResponse(response), Some(Message::RegisterRequest(request))) => {
            handler.register_response(packet, response, request)
        }
        (Message::JoinResponse(response), Some(Message::JoinRequest(request))) => {
            handler.join_response(packet, response, request)
        }
        (Message::LeaveResponse(response), Some(Message::LeaveRequest(request))) => {
            handler.leave_response(packet, response, request)
        }
        (Message::SyncResponse(response), Some(Message::SyncRequest(request))) => {
            handler.sync_response(packet, response, request)
        }
        (response, request) => {
            tracing::warn!(
                kind = response.kind(),
                request_kind = request.map(Message::kind),
                seq = packet.seq(),
                "response does not match its request"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use zerocopy::AsBytes;

    use super::*;
    use crate::{
        id::{NodeId, Token},
        message::{GroupFields, MemberList},
        protocol::{
            kind, JoinCode, SyncNotifyCode, MAX_GROUP_SIZE, MAX_PACKET_SIZE,
            NODE_ID_MAX_ENCODED_SIZE,
        },
    };

    #[derive(Default)]
    struct Pipe {
        bytes: VecDeque<u8>,
        closed: bool,
    }

    /// One end of an in-memory non-blocking duplex stream.
    struct MemoryStream {
        incoming: Arc<Mutex<Pipe>>,
        outgoing: Arc<Mutex<Pipe>>,
        write_limit: Option<usize>,
    }

    impl MemoryStream {
        fn pair() -> (Self, Self) {
            let a = Arc::new(Mutex::new(Pipe::default()));
            let b = Arc::new(Mutex::new(Pipe::default()));
            (
                Self {
                    incoming: a.clone(),
                    outgoing: b.clone(),
                    write_limit: None,
                },
                Self {
                    incoming: b,
                    outgoing: a,
                    write_limit: None,
                },
            )
        }

        fn close(&self) {
            self.outgoing.lock().unwrap().closed = true;
        }
    }

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut pipe = self.incoming.lock().unwrap();
            if pipe.bytes.is_empty() {
                return if pipe.closed {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(pipe.bytes.len());
            for (dst, src) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for MemoryStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_limit {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(limit) => {
                    let n = limit.min(buf.len());
                    self.write_limit = Some(limit - n);
                    n
                }
                None => buf.len(),
            };
            self.outgoing
                .lock()
                .unwrap()
                .bytes
                .extend(buf[..n].iter().copied());
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn join_request() -> Packet {
        Packet::new(JoinRequest {
            sender: Token::random(),
            group: GroupFields {
                group_id: NodeId::new("group").unwrap(),
                group_token: Token::from_secret("secret"),
            },
        })
    }

    fn join_response(request: &Packet, code: JoinCode) -> Packet {
        let Message::JoinRequest(join) = &request.message else {
            unreachable!()
        };
        Packet::response_to(
            request,
            JoinResponse {
                sender: Token::random(),
                group: join.group.clone(),
                code,
            },
        )
    }

    fn drain(messenger: &mut Messenger<MemoryStream>) -> (Vec<Packet>, ReadResult) {
        let mut packets = Vec::new();
        loop {
            match messenger.read(&mut packets).unwrap() {
                ReadResult::MoreAvailable => continue,
                result => return (packets, result),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        join_requests: Vec<SequenceNumber>,
        join_responses: Vec<(JoinCode, SequenceNumber)>,
    }

    impl PacketHandler for Recorder {
        fn join_request(&mut self, packet: &Packet, _request: &JoinRequest) {
            self.join_requests.push(packet.seq());
        }

        fn join_response(&mut self, packet: &Packet, response: &JoinResponse, _: &JoinRequest) {
            self.join_responses.push((response.code, packet.seq()));
        }
    }

    #[test]
    fn request_response_correlation() {
        let (a, b) = MemoryStream::pair();
        let mut client = Messenger::new(a);
        let mut server = Messenger::new(b);

        let request = join_request();
        client.send(&request).unwrap();
        assert!(client.is_pending(request.seq()));

        let (packets, result) = drain(&mut server);
        assert_eq!(result, ReadResult::Exhausted);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].message, request.message);

        let mut recorder = Recorder::default();
        dispatch(&mut recorder, &packets[0]);
        assert_eq!(recorder.join_requests, [request.seq()]);

        server
            .send(&join_response(&packets[0], JoinCode::GroupFull))
            .unwrap();
        let (packets, _) = drain(&mut client);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].request.as_deref(), Some(&request.message));
        assert!(!client.is_pending(request.seq()));

        dispatch(&mut recorder, &packets[0]);
        assert_eq!(
            recorder.join_responses,
            [(JoinCode::GroupFull, request.seq())]
        );
    }

    #[test]
    fn cancelled_and_unknown_responses_are_dropped() {
        let (a, b) = MemoryStream::pair();
        let mut client = Messenger::new(a);
        let mut server = Messenger::new(b);

        let request = join_request();
        client.send(&request).unwrap();
        assert!(client.cancel(request.seq()));
        assert!(!client.cancel(request.seq()));

        server
            .send(&join_response(&request, JoinCode::Accepted))
            .unwrap();
        // Never requested at all.
        server
            .send(&join_response(&join_request(), JoinCode::Accepted))
            .unwrap();

        let (packets, _) = drain(&mut client);
        assert!(packets.is_empty());
    }

    #[test]
    fn packets_split_across_reads() {
        let (a, mut b) = MemoryStream::pair();
        let mut server = Messenger::new(a);

        let first = join_request();
        let second = join_request();
        let mut bytes = first.encode();
        bytes.extend(second.encode());

        for chunk in bytes.chunks(7) {
            b.write_all(chunk).unwrap();
            let (packets, _) = drain(&mut server);
            for packet in packets {
                assert!(packet == first || packet == second);
            }
        }
        assert!(server.input.is_empty());
    }

    #[test]
    fn several_packets_in_one_read() {
        let (a, mut b) = MemoryStream::pair();
        let mut server = Messenger::new(a);

        let requests = (0..5).map(|_| join_request()).collect::<Vec<_>>();
        let bytes = requests.iter().flat_map(Packet::encode).collect::<Vec<_>>();
        b.write_all(&bytes).unwrap();

        let mut packets = Vec::new();
        assert_eq!(
            server.read(&mut packets).unwrap(),
            ReadResult::MoreAvailable
        );
        assert_eq!(packets, requests);
    }

    #[test]
    fn unsupported_version_and_unknown_kind_are_skipped() {
        let (a, mut b) = MemoryStream::pair();
        let mut server = Messenger::new(a);

        let mut old = join_request().encode();
        old[3] = 2;
        b.write_all(&old).unwrap();

        let mut unknown = Header::new(42, 0, 3).as_bytes().to_vec();
        unknown.extend([1, 2, 3]);
        b.write_all(&unknown).unwrap();

        let request = join_request();
        b.write_all(&request.encode()).unwrap();

        let (packets, _) = drain(&mut server);
        assert_eq!(packets, [request]);
    }

    #[test]
    fn malformed_body_keeps_stream_in_sync() {
        let (a, mut b) = MemoryStream::pair();
        let mut server = Messenger::new(a);

        let mut bad = Header::new(kind::JOIN_REQUEST, 1000, 4).as_bytes().to_vec();
        bad.extend([0, 0, 0, 0]);
        b.write_all(&bad).unwrap();

        let request = join_request();
        b.write_all(&request.encode()).unwrap();

        let (packets, _) = drain(&mut server);
        assert_eq!(packets, [request]);
    }

    #[test]
    fn invalid_length_is_an_error() {
        let (a, mut b) = MemoryStream::pair();
        let mut server = Messenger::new(a);

        let mut header = Header::new(kind::JOIN_REQUEST, 1000, 0);
        header.total_length = 8.into();
        b.write_all(&header.as_bytes().to_vec()).unwrap();

        let mut packets = Vec::new();
        let err = server.read(&mut packets).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_packets_are_refused() {
        let (a, b) = MemoryStream::pair();
        let mut sender = Messenger::new(a);
        let mut receiver = Messenger::new(b);
        let notify = |members: usize| {
            Packet::new(SyncNotify {
                sender: Token::random(),
                group: GroupFields {
                    group_id: NodeId::new("g".repeat(32)).unwrap(),
                    group_token: Token::from_secret("secret"),
                },
                members: MemberList(
                    (0..members)
                        .map(|i| NodeId::new(format!("{i:032}")).unwrap())
                        .collect(),
                ),
                sync_point: NodeId::new("s".repeat(32)).unwrap(),
                code: SyncNotifyCode::Join,
            })
        };

        let full = notify(MAX_GROUP_SIZE);
        sender.send(&full).unwrap();
        let (packets, result) = drain(&mut receiver);
        assert_eq!(result, ReadResult::Exhausted);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].message, full.message);

        let oversized = notify(MAX_PACKET_SIZE / NODE_ID_MAX_ENCODED_SIZE);
        let err = sender.send(&oversized).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!sender.has_pending_output());
        assert_eq!(sender.packets_sent(), 1);
        let (packets, result) = drain(&mut receiver);
        assert!(packets.is_empty());
        assert_eq!(result, ReadResult::Exhausted);
    }

    #[test]
    fn peer_close_is_reported() {
        let (a, b) = MemoryStream::pair();
        let mut server = Messenger::new(a);
        b.close();

        let mut packets = Vec::new();
        assert_eq!(server.read(&mut packets).unwrap(), ReadResult::PeerClosed);
    }

    #[test]
    fn blocked_output_is_kept_until_flushed() {
        let (mut a, b) = MemoryStream::pair();
        a.write_limit = Some(10);
        let mut client = Messenger::new(a);
        let mut server = Messenger::new(b);

        let request = join_request();
        client.send(&request).unwrap();
        assert!(client.has_pending_output());

        client.stream_mut().write_limit = None;
        client.flush().unwrap();
        assert!(!client.has_pending_output());

        let (packets, _) = drain(&mut server);
        assert_eq!(packets, [request]);
    }
}
