use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use mio::{net::TcpStream, Events, Interest, Poll, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    id::{NodeId, Token},
    membership::{Group, GroupState, JoinError},
    message::{
        GroupNotify, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, Packet,
        RegisterRequest, RegisterResponse, SyncNotify, SyncRequest, SyncResponse,
    },
    messenger::{dispatch, Messenger, PacketHandler, ReadResult},
    protocol::{RegisterCode, SequenceNumber},
    server::ConfigError,
    utils::{lock, wait_timeout, StopWatch},
};

const STREAM: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

/// Configuration of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time to wait for the TCP connection to the server.
    ///
    /// The default is 1 second.
    pub connect_timeout: Duration,

    /// Upper bound for a single wait for socket readiness. This bounds how
    /// long the network thread takes to notice a stop request.
    ///
    /// The default is 100 milliseconds.
    pub select_timeout: Duration,

    /// Time to wait for the server to answer the registration.
    ///
    /// The default is 2 seconds.
    pub register_timeout: Duration,

    /// Time to wait for the server to answer a join or leave request.
    ///
    /// The default is 2 seconds.
    pub group_message_timeout: Duration,

    /// Added to the timeout of [`Group::wait_sync`] to cover the round trip
    /// and the delivery of the server's notification.
    ///
    /// The default is 500 milliseconds.
    pub sync_extra_latency: Duration,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.connect_timeout, "Connect timeout"),
            (self.select_timeout, "Select timeout"),
            (self.register_timeout, "Register timeout"),
            (self.group_message_timeout, "Group message timeout"),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            select_timeout: Duration::from_millis(100),
            register_timeout: Duration::from_secs(2),
            group_message_timeout: Duration::from_secs(2),
            sync_extra_latency: Duration::from_millis(500),
        }
    }
}

/// Indicates an error when starting a client.
#[derive(thiserror::Error, Debug)]
pub enum StartClientError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Failed to connect: {0}")]
    Connect(io::Error),

    #[error("Failed to spawn network thread: {0}")]
    Spawn(io::Error),

    /// The server has reached its maximum number of clients.
    #[error("Server is full")]
    ServerFull,

    /// Another client with the same id is registered.
    #[error("Client id is already in use")]
    IdInUse,

    /// The connection was closed before the server answered.
    #[error("Connection lost during registration")]
    ConnectionLost,

    /// The server did not answer in time.
    #[error("Registration timed out")]
    Timeout,
}

/// Indicates that a request could not be sent.
#[derive(thiserror::Error, Debug)]
pub(crate) enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
enum Registration {
    Idle,
    Pending,
    Accepted(Token),
    Rejected(RegisterCode),
    ConnectFailed(io::Error),
    Lost,
}

/// State shared between the caller threads and the network thread.
pub(crate) struct ClientShared {
    id: NodeId,
    pub(crate) config: ClientConfig,
    messenger: Mutex<Option<Messenger<TcpStream>>>,
    registration: Mutex<Registration>,
    registration_changed: Condvar,
    groups: DashMap<NodeId, Arc<GroupState>>,
    running: AtomicBool,
}

impl ClientShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The token issued by the server, or the null token if not registered.
    pub fn token(&self) -> Token {
        match &*lock(&self.registration) {
            Registration::Accepted(token) => *token,
            _ => Token::NULL,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.is_running() && matches!(&*lock(&self.registration), Registration::Accepted(_))
    }

    pub fn send(&self, packet: &Packet) -> Result<(), SendError> {
        match &mut *lock(&self.messenger) {
            Some(messenger) => Ok(messenger.send(packet)?),
            None => Err(SendError::NotConnected),
        }
    }

    /// Packets sent on the current connection.
    pub fn packets_sent(&self) -> u64 {
        lock(&self.messenger)
            .as_ref()
            .map_or(0, Messenger::packets_sent)
    }

    /// Forgets an outstanding request, see [`Messenger::cancel`].
    pub fn cancel(&self, seq: SequenceNumber) {
        if let Some(messenger) = &mut *lock(&self.messenger) {
            messenger.cancel(seq);
        }
    }

    fn group(&self, id: &NodeId) -> Option<Arc<GroupState>> {
        self.groups.get(id).map(|state| state.value().clone())
    }

    fn set_registration(&self, registration: Registration) {
        *lock(&self.registration) = registration;
        self.registration_changed.notify_all();
    }

    /// Tears down the connection and wakes up every waiting caller.
    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        lock(&self.messenger).take();
        {
            let mut registration = lock(&self.registration);
            if matches!(*registration, Registration::Pending) {
                *registration = Registration::Lost;
            }
        }
        self.registration_changed.notify_all();

        let groups = self
            .groups
            .iter()
            .map(|state| state.value().clone())
            .collect::<Vec<_>>();
        for state in groups {
            state.connection_lost();
        }
    }
}

fn connect(server: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(server), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect_timeout(&server.into(), timeout)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    Ok(TcpStream::from_std(socket.into()))
}

/// Runs the client's connection: connect, register and handle packets until
/// stopped or the connection fails.
fn network_thread(shared: Arc<ClientShared>, server: SocketAddr, mut poll: Poll) {
    let mut stream = match connect(server, shared.config.connect_timeout) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::debug!(%server, %err, "failed to connect");
            shared.set_registration(Registration::ConnectFailed(err));
            shared.shutdown();
            return;
        }
    };
    if let Err(err) = poll.registry().register(
        &mut stream,
        STREAM,
        Interest::READABLE | Interest::WRITABLE,
    ) {
        shared.set_registration(Registration::ConnectFailed(err));
        shared.shutdown();
        return;
    }
    *lock(&shared.messenger) = Some(Messenger::new(stream));

    let register = Packet::new(RegisterRequest {
        sender: Token::NULL,
        client_id: shared.id.clone(),
    });
    if let Err(err) = shared.send(&register) {
        tracing::debug!(%err, "failed to send registration");
        shared.shutdown();
        return;
    }

    let mut events = Events::with_capacity(16);
    let mut packets = Vec::new();
    'outer: while shared.is_running() {
        if let Err(err) = poll.poll(&mut events, Some(shared.config.select_timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(%err, "failed to poll");
            break;
        }

        for event in events.iter() {
            if event.token() != STREAM {
                continue;
            }

            if event.is_writable() {
                if let Some(messenger) = &mut *lock(&shared.messenger) {
                    if let Err(err) = messenger.flush() {
                        tracing::debug!(%err, "failed to write");
                        break 'outer;
                    }
                }
            }

            if event.is_readable() || event.is_read_closed() {
                loop {
                    let result = match &mut *lock(&shared.messenger) {
                        Some(messenger) => messenger.read(&mut packets),
                        None => break 'outer,
                    };
                    let mut handler = ClientHandler { shared: &shared };
                    for packet in packets.drain(..) {
                        dispatch(&mut handler, &packet);
                    }

                    match result {
                        Ok(ReadResult::MoreAvailable) => continue,
                        Ok(ReadResult::Exhausted) => break,
                        Ok(ReadResult::PeerClosed) => {
                            tracing::debug!("server closed connection");
                            break 'outer;
                        }
                        Err(err) => {
                            tracing::debug!(%err, "failed to read");
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(packets_sent = shared.packets_sent(), "network thread finished");
    shared.shutdown();
}

/// Applies the server's responses and notifications to the shared state.
struct ClientHandler<'a> {
    shared: &'a ClientShared,
}

impl PacketHandler for ClientHandler<'_> {
    fn register_response(&mut self, _: &Packet, response: &RegisterResponse, _: &RegisterRequest) {
        match response.code {
            RegisterCode::Accepted => {
                tracing::debug!("registered");
                self.shared
                    .set_registration(Registration::Accepted(response.client_token));
            }
            code => {
                tracing::debug!(?code, "registration rejected");
                self.shared.set_registration(Registration::Rejected(code));
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }

    fn join_response(&mut self, packet: &Packet, response: &JoinResponse, request: &JoinRequest) {
        if let Some(state) = self.shared.group(&request.group.group_id) {
            state.join_answered(packet.seq(), response.code, &self.shared.id);
        }
    }

    fn leave_response(&mut self, packet: &Packet, _: &LeaveResponse, request: &LeaveRequest) {
        if let Some(state) = self.shared.group(&request.group.group_id) {
            state.leave_answered(packet.seq());
        }
    }

    fn group_notify(&mut self, _: &Packet, notify: &GroupNotify) {
        let Some(state) = self.shared.group(&notify.group.group_id) else {
            return;
        };
        if state.token() != notify.group.group_token {
            tracing::debug!(
                group = %notify.group.group_id,
                "ignoring notification for other token"
            );
            return;
        }
        state.members_changed(notify.code, &notify.members.0, &self.shared.id);
    }

    fn sync_response(&mut self, packet: &Packet, response: &SyncResponse, request: &SyncRequest) {
        if let Some(state) = self.shared.group(&request.group.group_id) {
            state.sync_answered(packet.seq(), &response.sync.sync_point, response.code);
        }
    }

    fn sync_notify(&mut self, _: &Packet, notify: &SyncNotify) {
        if let Some(state) = self.shared.group(&notify.group.group_id) {
            state.sync_notified(&notify.sync_point, notify.code);
        }
    }
}

/// A client of the rendezvous server.
///
/// The client runs a network thread that owns the connection to the server.
/// All methods may be called from any thread, blocking methods are bounded by
/// the timeouts in [`ClientConfig`].
pub struct Client {
    shared: Arc<ClientShared>,
    server: SocketAddr,
    waker: Option<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Creates a client that registers as `id` with the server at `server`.
    ///
    /// The client does not connect before [`Self::start`] is called.
    pub fn new(
        server: SocketAddr,
        id: NodeId,
        config: ClientConfig,
    ) -> Result<Self, StartClientError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ClientShared {
                id,
                config,
                messenger: Mutex::new(None),
                registration: Mutex::new(Registration::Idle),
                registration_changed: Condvar::new(),
                groups: DashMap::new(),
                running: AtomicBool::new(false),
            }),
            server,
            waker: None,
            thread: None,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn is_registered(&self) -> bool {
        self.shared.is_registered()
    }

    /// Connects to the server and registers.
    ///
    /// Blocks until the server accepted or rejected the registration, the
    /// connection is lost or the connect and register timeouts elapse.
    /// Starting a registered client does nothing.
    #[tracing::instrument(skip(self), fields(client = %self.shared.id))]
    pub fn start(&mut self) -> Result<(), StartClientError> {
        if self.is_registered() {
            return Ok(());
        }
        self.stop();

        let poll = Poll::new().map_err(StartClientError::Spawn)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(StartClientError::Spawn)?;

        self.shared.set_registration(Registration::Pending);
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let server = self.server;
        let thread = std::thread::Builder::new()
            .name(format!("rendezvous-client-{}", self.shared.id))
            .spawn(move || {
                let _span = tracing::debug_span!("client", id = %shared.id).entered();
                network_thread(shared, server, poll)
            });
        match thread {
            Ok(thread) => {
                self.thread = Some(thread);
                self.waker = Some(waker);
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                self.shared.set_registration(Registration::Idle);
                return Err(StartClientError::Spawn(err));
            }
        }

        let config = &self.shared.config;
        let budget = config.connect_timeout.saturating_add(config.register_timeout);
        let stop_watch = StopWatch::start(budget);
        let mut registration = lock(&self.shared.registration);
        let result = loop {
            match std::mem::replace(&mut *registration, Registration::Lost) {
                Registration::Accepted(token) => {
                    *registration = Registration::Accepted(token);
                    break Ok(());
                }
                Registration::Pending if stop_watch.has_time_left() => {
                    *registration = Registration::Pending;
                    registration = wait_timeout(
                        &self.shared.registration_changed,
                        registration,
                        stop_watch.time_left(),
                    );
                }
                Registration::Pending => break Err(StartClientError::Timeout),
                Registration::Rejected(RegisterCode::ServerFull) => {
                    break Err(StartClientError::ServerFull)
                }
                Registration::Rejected(_) => break Err(StartClientError::IdInUse),
                Registration::ConnectFailed(err) => break Err(StartClientError::Connect(err)),
                Registration::Idle | Registration::Lost => {
                    break Err(StartClientError::ConnectionLost)
                }
            }
        };
        drop(registration);

        if let Err(err) = &result {
            tracing::debug!(%err, "failed to start client");
            self.stop();
        }
        result
    }

    /// Stops the network thread and closes the connection.
    ///
    /// All groups are left implicitly, blocked calls return.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(waker) = self.waker.take() {
            if let Err(err) = waker.wake() {
                tracing::warn!(%err, "failed to wake network thread");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("network thread panicked");
            }
        }
    }

    /// Joins a group, see [`Group::join`].
    ///
    /// If the client is already a member of the group with a different token,
    /// it leaves the group first.
    ///
    /// A group whose first join fails is forgotten again.
    pub fn join(&self, group_id: NodeId, token: Token) -> Result<Group, JoinError> {
        let (state, created) = match self.shared.groups.entry(group_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let state = Arc::new(GroupState::new(group_id, token));
                entry.insert(state.clone());
                (state, true)
            }
        };
        let group = Group::new(self.shared.clone(), state.clone());
        if let Err(err) = group.join_with(token) {
            if created && !group.is_joined() {
                self.shared
                    .groups
                    .remove_if(group.id(), |_, current| Arc::ptr_eq(current, &state));
            }
            return Err(err);
        }
        Ok(group)
    }

    /// A handle to a group this client joined before.
    pub fn group(&self, group_id: &NodeId) -> Option<Group> {
        self.shared
            .group(group_id)
            .map(|state| Group::new(self.shared.clone(), state))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
