use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ahash::HashMap;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Waker,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    group::{ConnectionId, Context, GroupRegistry, Outgoing, ServerEvent, SyncReply},
    id::{NodeId, Token},
    message::{
        JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, MemberList, Message, Packet,
        RegisterRequest, RegisterResponse, SyncFields, SyncRequest, SyncResponse,
    },
    messenger::{dispatch, Messenger, PacketHandler, ReadResult},
    protocol::{JoinCode, LeaveCode, RegisterCode, SyncCode, MAX_GROUP_SIZE},
    scheduler::EventScheduler,
    utils::sock_addr_to_socket_addr,
};

const LISTENER: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);
const FIRST_CONNECTION: ConnectionId = 2;

/// Indicates an invalid server or client configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A timeout, interval or capacity is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Idle groups would not be detected in time.
    #[error("Housekeeping interval must be less than the group idle timeout")]
    HousekeepingIntervalNotBelowIdleTimeout,

    /// The member list of a full group would not fit into a packet.
    #[error("Group max size must not exceed {max}")]
    GroupMaxSizeTooLarge { max: usize },
}

/// Configuration of a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The address to listen on.
    ///
    /// The default is `127.0.0.1:0`, i.e., a random port on the loopback
    /// interface. Use [`Server::local_addr`] to find out the actual port.
    pub bind_address: SocketAddr,

    /// Upper bound for a single wait for socket readiness.
    ///
    /// The default is 100 milliseconds.
    pub select_timeout: Duration,

    /// Maximum number of members per group. At most
    /// [`MAX_GROUP_SIZE`](crate::protocol::MAX_GROUP_SIZE) so that the member
    /// list of a full group fits into a single packet.
    ///
    /// The default is 16.
    pub group_max_size: usize,

    /// Maximum number of registered clients.
    ///
    /// The default is 64.
    pub max_clients: usize,

    /// Groups without any join, leave or sync activity for this long are
    /// closed.
    ///
    /// The default is 60 seconds.
    pub group_idle_timeout: Duration,

    /// Interval at which idle groups are looked for. Must be less than the
    /// idle timeout.
    ///
    /// The default is 1 second.
    pub housekeeping_interval: Duration,

    /// Time to wait for the server thread to become ready.
    ///
    /// The default is 2 seconds.
    pub start_timeout: Duration,

    /// Time to wait for the server thread to finish when stopping.
    ///
    /// The default is 2 seconds.
    pub stop_timeout: Duration,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.select_timeout, "Select timeout"),
            (self.group_idle_timeout, "Group idle timeout"),
            (self.housekeeping_interval, "Housekeeping interval"),
            (self.start_timeout, "Start timeout"),
            (self.stop_timeout, "Stop timeout"),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.group_max_size == 0 {
            return Err(ConfigError::Zero("Group max size"));
        }
        if self.group_max_size > MAX_GROUP_SIZE {
            return Err(ConfigError::GroupMaxSizeTooLarge {
                max: MAX_GROUP_SIZE,
            });
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Zero("Max clients"));
        }
        if self.housekeeping_interval >= self.group_idle_timeout {
            return Err(ConfigError::HousekeepingIntervalNotBelowIdleTimeout);
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            select_timeout: Duration::from_millis(100),
            group_max_size: 16,
            max_clients: 64,
            group_idle_timeout: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(1),
            start_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Indicates an error when starting the server.
#[derive(thiserror::Error, Debug)]
pub enum StartServerError {
    /// The configuration is invalid.
    ///
    /// See [`ConfigError`] for details.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Failed to create socket: {0}")]
    SocketCreateError(io::Error),

    #[error("Failed to bind socket: {0}")]
    SocketBindError(io::Error),

    #[error("Failed to create poller: {0}")]
    PollError(io::Error),

    #[error("Failed to spawn server thread: {0}")]
    SpawnError(io::Error),

    /// The server thread did not report readiness within the start timeout.
    #[error("Server thread did not start in time")]
    Timeout,
}

struct Registration {
    id: NodeId,
    token: Token,
}

/// Everything the request handlers act on.
struct ServerState {
    token: Token,
    max_clients: usize,
    clients: HashMap<NodeId, ConnectionId>,
    registrations: HashMap<ConnectionId, Registration>,
    registry: GroupRegistry,
    scheduler: EventScheduler<ServerEvent>,
    outgoing: Vec<Outgoing>,
}

impl ServerState {
    fn connection_lost(&mut self, connection: ConnectionId, now: Instant) {
        if let Some(registration) = self.registrations.remove(&connection) {
            tracing::debug!(client = %registration.id, "client unregistered");
            self.clients.remove(&registration.id);
        }
        self.registry.remove_connection(
            &mut Context {
                now,
                scheduler: &mut self.scheduler,
                outgoing: &mut self.outgoing,
            },
            connection,
        );
    }

    fn fire_due_events(&mut self, now: Instant) {
        while let Some(event) = self.scheduler.pop_due(now) {
            tracing::trace!(?event, "fire event");
            self.registry.handle_event(
                &mut Context {
                    now,
                    scheduler: &mut self.scheduler,
                    outgoing: &mut self.outgoing,
                },
                event,
            );
        }
    }
}

/// Handles the requests of a single connection.
struct RequestHandler<'a> {
    connection: ConnectionId,
    now: Instant,
    state: &'a mut ServerState,
}

impl RequestHandler<'_> {
    /// Returns the id of the registered client if `sender` is the token issued
    /// to this connection.
    fn authenticate(&self, sender: &Token) -> Option<NodeId> {
        self.state
            .registrations
            .get(&self.connection)
            .filter(|registration| registration.token == *sender)
            .map(|registration| registration.id.clone())
    }

    /// Queues a response ahead of the notifications queued since `position`.
    fn respond_at(&mut self, position: usize, request: &Packet, message: impl Into<Message>) {
        self.state.outgoing.insert(
            position,
            Outgoing {
                to: self.connection,
                packet: Packet::response_to(request, message),
            },
        );
    }
}

impl PacketHandler for RequestHandler<'_> {
    #[tracing::instrument(
        skip_all,
        fields(connection = self.connection, client = %request.client_id)
    )]
    fn register_request(&mut self, packet: &Packet, request: &RegisterRequest) {
        let state = &mut *self.state;
        let owner = state.clients.get(&request.client_id).copied();

        let code = match owner {
            Some(owner) if owner == self.connection => RegisterCode::Accepted,
            Some(_) => RegisterCode::AuthenticationFailure,
            // Group members are known by their id, a member cannot rename.
            None if state.registry.has_connection(self.connection) => {
                tracing::debug!("rename rejected: connection is a group member");
                RegisterCode::AuthenticationFailure
            }
            None if state.registrations.contains_key(&self.connection) => {
                // The connection renames itself.
                if let Some(previous) = state.registrations.remove(&self.connection) {
                    state.clients.remove(&previous.id);
                }
                RegisterCode::Accepted
            }
            None if state.clients.len() >= state.max_clients => RegisterCode::ServerFull,
            None => RegisterCode::Accepted,
        };

        let client_token = if code == RegisterCode::Accepted {
            let registration = state
                .registrations
                .entry(self.connection)
                .or_insert_with(|| Registration {
                    id: request.client_id.clone(),
                    token: Token::random(),
                });
            state.clients.insert(request.client_id.clone(), self.connection);
            tracing::debug!("client registered");
            registration.token
        } else {
            tracing::debug!(?code, "registration rejected");
            Token::NULL
        };

        let position = state.outgoing.len();
        let server_token = state.token;
        self.respond_at(
            position,
            packet,
            RegisterResponse {
                sender: server_token,
                client_token,
                code,
            },
        );
    }

    fn join_request(&mut self, packet: &Packet, request: &JoinRequest) {
        let position = self.state.outgoing.len();
        let code = match self.authenticate(&request.sender) {
            Some(member) => self.state.registry.join(
                &mut Context {
                    now: self.now,
                    scheduler: &mut self.state.scheduler,
                    outgoing: &mut self.state.outgoing,
                },
                self.connection,
                &member,
                &request.group,
            ),
            None => JoinCode::AuthenticationFailure,
        };
        self.respond_at(
            position,
            packet,
            JoinResponse {
                sender: self.state.token,
                group: request.group.clone(),
                code,
            },
        );
    }

    fn leave_request(&mut self, packet: &Packet, request: &LeaveRequest) {
        let position = self.state.outgoing.len();
        if self.authenticate(&request.sender).is_some() {
            self.state.registry.leave(
                &mut Context {
                    now: self.now,
                    scheduler: &mut self.state.scheduler,
                    outgoing: &mut self.state.outgoing,
                },
                self.connection,
                &request.group,
            );
        }
        self.respond_at(
            position,
            packet,
            LeaveResponse {
                sender: self.state.token,
                group: request.group.clone(),
                code: LeaveCode::Accepted,
            },
        );
    }

    fn sync_request(&mut self, packet: &Packet, request: &SyncRequest) {
        let position = self.state.outgoing.len();
        let reply = match self.authenticate(&request.sender) {
            Some(_) => self.state.registry.sync(
                &mut Context {
                    now: self.now,
                    scheduler: &mut self.state.scheduler,
                    outgoing: &mut self.state.outgoing,
                },
                self.connection,
                &request.group,
                &request.sync,
            ),
            None => SyncReply {
                code: SyncCode::AuthenticationFailure,
                time_left: Duration::ZERO,
                members: Vec::new(),
            },
        };
        self.respond_at(
            position,
            packet,
            SyncResponse {
                sender: self.state.token,
                group: request.group.clone(),
                members: MemberList(reply.members),
                sync: SyncFields {
                    timeout: i64::try_from(reply.time_left.as_millis()).unwrap_or(i64::MAX),
                    sync_point: request.sync.sync_point.clone(),
                },
                code: reply.code,
            },
        );
    }
}

struct Connection {
    messenger: Messenger<TcpStream>,
    addr: SocketAddr,
}

/// The server's event loop. Owns all connections and all group state.
struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    select_timeout: Duration,
    housekeeping_interval: Duration,
    state: ServerState,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    fn run(mut self, ready: Sender<io::Result<()>>) {
        let registered =
            self.poll
                .registry()
                .register(&mut self.listener, LISTENER, Interest::READABLE);
        let failed = registered.is_err();
        // The starting thread may have given up already.
        let _ = ready.send(registered);
        if failed {
            return;
        }

        self.state.scheduler.schedule(
            Instant::now(),
            self.housekeeping_interval,
            ServerEvent::Housekeeping,
            true,
        );

        let mut events = Events::with_capacity(256);
        while !self.stop.load(Ordering::Acquire) {
            let timeout = match self.state.scheduler.next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.select_timeout),
                None => self.select_timeout,
            };

            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(%err, "failed to poll");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    mio::Token(connection) => {
                        let readable = event.is_readable() || event.is_read_closed();
                        self.service(connection, readable, event.is_writable());
                    }
                }
            }

            self.state.fire_due_events(Instant::now());
            self.deliver();
        }

        tracing::debug!(
            connections = self.connections.len(),
            pending_events = self.state.scheduler.len(),
            "server stopped"
        );
        self.connections.clear();
        self.state.scheduler.clear();
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.state.clients.len() >= self.state.max_clients {
                        tracing::debug!(from = %addr, "refusing connection: server full");
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(from = %addr, %err, "failed to set nodelay");
                    }

                    let connection = self.next_connection;
                    self.next_connection += 1;
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        mio::Token(connection),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        tracing::warn!(from = %addr, %err, "failed to register connection");
                        continue;
                    }

                    tracing::debug!(from = %addr, connection, "accepted connection");
                    self.connections.insert(
                        connection,
                        Connection {
                            messenger: Messenger::new(stream),
                            addr,
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!(%err, "failed to accept connection");
                    break;
                }
            }
        }
    }

    fn service(&mut self, connection: ConnectionId, readable: bool, writable: bool) {
        let mut close = readable && self.drain(connection);

        if !close && writable {
            if let Some(conn) = self.connections.get_mut(&connection) {
                if let Err(err) = conn.messenger.flush() {
                    tracing::debug!(from = %conn.addr, %err, "failed to write");
                    close = true;
                }
            }
        }

        if close {
            self.close(connection);
        }
        self.deliver();
    }

    /// Reads from the connection until it would block. Returns whether the
    /// connection should be closed.
    fn drain(&mut self, connection: ConnectionId) -> bool {
        let mut packets = Vec::new();
        loop {
            let Some(conn) = self.connections.get_mut(&connection) else {
                return false;
            };
            let result = conn.messenger.read(&mut packets);
            let addr = conn.addr;

            let mut handler = RequestHandler {
                connection,
                now: Instant::now(),
                state: &mut self.state,
            };
            for packet in packets.drain(..) {
                tracing::trace!(
                    from = %addr,
                    kind = packet.kind(),
                    seq = packet.seq(),
                    "received packet"
                );
                dispatch(&mut handler, &packet);
            }

            match result {
                Ok(ReadResult::MoreAvailable) => continue,
                Ok(ReadResult::Exhausted) => return false,
                Ok(ReadResult::PeerClosed) => {
                    tracing::debug!(from = %addr, "peer closed connection");
                    return true;
                }
                Err(err) => {
                    tracing::debug!(from = %addr, %err, "failed to read");
                    return true;
                }
            }
        }
    }

    fn close(&mut self, connection: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&connection) else {
            return;
        };
        tracing::debug!(from = %conn.addr, connection, "close connection");
        if let Err(err) = self.poll.registry().deregister(conn.messenger.stream_mut()) {
            tracing::trace!(%err, "failed to deregister connection");
        }
        self.state.connection_lost(connection, Instant::now());
    }

    /// Sends every queued packet. Connections that fail are closed, which may
    /// queue further notifications.
    fn deliver(&mut self) {
        while !self.state.outgoing.is_empty() {
            let mut failed = Vec::new();
            for Outgoing { to, packet } in std::mem::take(&mut self.state.outgoing) {
                let Some(conn) = self.connections.get_mut(&to) else {
                    tracing::trace!(connection = to, kind = packet.kind(), "recipient gone");
                    continue;
                };
                match conn.messenger.send(&packet) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                        tracing::error!(kind = packet.kind(), %err, "dropping packet");
                    }
                    Err(err) => {
                        tracing::debug!(from = %conn.addr, %err, "failed to send");
                        failed.push(to);
                    }
                }
            }
            for connection in failed {
                self.close(connection);
            }
        }
    }
}

/// The rendezvous server.
///
/// The server runs a single thread that owns all connections, clients, groups
/// and sync points. It is stopped by [`Server::stop`] or when dropped.
pub struct Server {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl Server {
    /// Binds the listening socket and starts the server thread.
    pub fn start(config: ServerConfig) -> Result<Self, StartServerError> {
        config.validate()?;

        let socket = Socket::new(
            Domain::for_address(config.bind_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(StartServerError::SocketCreateError)?;
        socket
            .set_reuse_address(true)
            .map_err(StartServerError::SocketCreateError)?;
        socket
            .bind(&config.bind_address.into())
            .map_err(StartServerError::SocketBindError)?;
        socket
            .listen(128)
            .map_err(StartServerError::SocketBindError)?;
        socket
            .set_nonblocking(true)
            .map_err(StartServerError::SocketCreateError)?;
        let local_addr = socket
            .local_addr()
            .and_then(sock_addr_to_socket_addr)
            .map_err(StartServerError::SocketBindError)?;
        let listener = TcpListener::from_std(socket.into());

        let poll = Poll::new().map_err(StartServerError::PollError)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER).map_err(StartServerError::PollError)?);
        let stop = Arc::new(AtomicBool::new(false));

        let token = Token::random();
        let reactor = Reactor {
            poll,
            listener,
            connections: HashMap::default(),
            next_connection: FIRST_CONNECTION,
            select_timeout: config.select_timeout,
            housekeeping_interval: config.housekeeping_interval,
            state: ServerState {
                token,
                max_clients: config.max_clients,
                clients: HashMap::default(),
                registrations: HashMap::default(),
                registry: GroupRegistry::new(
                    token,
                    config.group_max_size,
                    config.group_idle_timeout,
                ),
                scheduler: EventScheduler::default(),
                outgoing: Vec::new(),
            },
            stop: stop.clone(),
        };

        let (ready_sender, ready_receiver) = crossbeam::channel::bounded(1);
        let (done_sender, done_receiver) = crossbeam::channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name(format!("rendezvous-server-{}", local_addr.port()))
            .spawn(move || {
                let _done = done_sender;
                let _span = tracing::debug_span!("server", addr = %local_addr).entered();
                reactor.run(ready_sender);
            })
            .map_err(StartServerError::SpawnError)?;

        let mut server = Self {
            local_addr,
            stop,
            waker,
            done: done_receiver,
            thread: Some(thread),
            stop_timeout: config.stop_timeout,
        };

        match ready_receiver.recv_timeout(config.start_timeout) {
            Ok(Ok(())) => {
                tracing::debug!(addr = %local_addr, "server started");
                Ok(server)
            }
            Ok(Err(err)) => {
                server.stop();
                Err(StartServerError::PollError(err))
            }
            Err(_) => {
                server.stop();
                Err(StartServerError::Timeout)
            }
        }
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stops the server thread, closing all connections.
    ///
    /// Returns false if the thread did not finish within the stop timeout, in
    /// which case it is detached.
    pub fn stop(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            tracing::warn!(%err, "failed to wake server thread");
        }

        match self.done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    tracing::error!("server thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("server thread did not stop in time");
                false
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
