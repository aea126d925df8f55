use std::{
    collections::hash_map::Entry,
    time::{Duration, Instant},
};

use ahash::HashMap;

use crate::{
    barrier::SyncPoint,
    id::{NodeId, Token},
    message::{GroupFields, GroupNotify, MemberList, Message, Packet, SyncFields, SyncNotify},
    protocol::{GroupNotifyCode, JoinCode, SyncCode, SyncNotifyCode},
    scheduler::EventScheduler,
};

/// Identifies a connection to the server.
pub(crate) type ConnectionId = usize;

/// Longer sync timeouts are capped so that deadlines stay representable.
pub(crate) const MAX_SYNC_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How a sync point is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Success,
    Timeout,
}

/// Events driven by the server's scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerEvent {
    Housekeeping,
    ResolveSync {
        group: NodeId,
        sync_point: NodeId,
        generation: u64,
        resolution: Resolution,
    },
}

/// A packet waiting to be delivered to a connection.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub to: ConnectionId,
    pub packet: Packet,
}

/// The reactor state a registry operation may act on.
pub(crate) struct Context<'a> {
    pub now: Instant,
    pub scheduler: &'a mut EventScheduler<ServerEvent>,
    pub outgoing: &'a mut Vec<Outgoing>,
}

impl Context<'_> {
    pub fn send(&mut self, to: ConnectionId, packet: Packet) {
        self.outgoing.push(Outgoing { to, packet });
    }

    fn broadcast(
        &mut self,
        recipients: impl IntoIterator<Item = ConnectionId>,
        message: impl Into<Message>,
    ) {
        let packet = Packet::new(message);
        for to in recipients {
            self.send(to, packet.clone());
        }
    }
}

#[derive(Debug)]
struct Group {
    id: NodeId,
    token: Token,
    members: HashMap<ConnectionId, NodeId>,
    sync_points: HashMap<NodeId, SyncPoint>,
    last_activity: Instant,
}

impl Group {
    fn fields(&self) -> GroupFields {
        GroupFields {
            group_id: self.id.clone(),
            group_token: self.token,
        }
    }

    fn member_list(&self) -> Vec<NodeId> {
        let mut members = self.members.values().cloned().collect::<Vec<_>>();
        members.sort();
        members
    }

    fn accepts(&self, connection: ConnectionId, token: &Token) -> bool {
        self.token == *token && self.members.contains_key(&connection)
    }
}

/// Outcome of a sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyncReply {
    pub code: SyncCode,
    pub time_left: Duration,
    pub members: Vec<NodeId>,
}

impl SyncReply {
    fn rejected(code: SyncCode) -> Self {
        Self {
            code,
            time_left: Duration::ZERO,
            members: Vec::new(),
        }
    }
}

/// All groups known to the server.
///
/// The registry is owned by the reactor thread. Every operation takes a
/// [`Context`] to schedule sync point events and to queue notifications.
pub(crate) struct GroupRegistry {
    groups: HashMap<NodeId, Group>,
    server_token: Token,
    max_group_size: usize,
    idle_timeout: Duration,
    next_generation: u64,
}

impl GroupRegistry {
    pub fn new(server_token: Token, max_group_size: usize, idle_timeout: Duration) -> Self {
        Self {
            groups: HashMap::default(),
            server_token,
            max_group_size,
            idle_timeout,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Sorted member ids of a group.
    pub fn members(&self, group_id: &NodeId) -> Option<Vec<NodeId>> {
        self.groups.get(group_id).map(Group::member_list)
    }

    /// Whether the connection is a member of any group.
    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.groups
            .values()
            .any(|group| group.members.contains_key(&connection))
    }

    /// Adds the connection to the group, creating the group if necessary.
    ///
    /// All members including the new one are notified about the new
    /// membership. Joining a group the connection is already a member of
    /// succeeds without any notification.
    #[tracing::instrument(skip(self, ctx, fields), fields(group = %fields.group_id))]
    pub fn join(
        &mut self,
        ctx: &mut Context,
        connection: ConnectionId,
        member: &NodeId,
        fields: &GroupFields,
    ) -> JoinCode {
        let group = self
            .groups
            .entry(fields.group_id.clone())
            .or_insert_with(|| {
                tracing::debug!("create group");
                Group {
                    id: fields.group_id.clone(),
                    token: fields.group_token,
                    members: HashMap::default(),
                    sync_points: HashMap::default(),
                    last_activity: ctx.now,
                }
            });

        if group.token != fields.group_token {
            tracing::debug!("join rejected: token mismatch");
            return JoinCode::AuthenticationFailure;
        }
        group.last_activity = ctx.now;

        if group.members.contains_key(&connection) {
            return JoinCode::Accepted;
        }
        if group.members.len() >= self.max_group_size {
            tracing::debug!(size = group.members.len(), "join rejected: group full");
            return JoinCode::GroupFull;
        }

        group.members.insert(connection, member.clone());
        tracing::debug!(size = group.members.len(), "member joined");

        ctx.broadcast(
            group.members.keys().copied().collect::<Vec<_>>(),
            GroupNotify {
                sender: self.server_token,
                group: group.fields(),
                members: MemberList(group.member_list()),
                code: GroupNotifyCode::Join,
            },
        );
        JoinCode::Accepted
    }

    /// Removes the connection from the group if it is a member with the
    /// right token. Returns whether anything changed.
    pub fn leave(
        &mut self,
        ctx: &mut Context,
        connection: ConnectionId,
        fields: &GroupFields,
    ) -> bool {
        let is_member = self
            .groups
            .get(&fields.group_id)
            .is_some_and(|group| group.accepts(connection, &fields.group_token));
        is_member && self.remove_member(ctx, &fields.group_id, connection)
    }

    /// Removes a lost connection from every group.
    pub fn remove_connection(&mut self, ctx: &mut Context, connection: ConnectionId) {
        let groups = self
            .groups
            .values()
            .filter(|group| group.members.contains_key(&connection))
            .map(|group| group.id.clone())
            .collect::<Vec<_>>();
        for group_id in groups {
            self.remove_member(ctx, &group_id, connection);
        }
    }

    #[tracing::instrument(skip(self, ctx))]
    fn remove_member(
        &mut self,
        ctx: &mut Context,
        group_id: &NodeId,
        connection: ConnectionId,
    ) -> bool {
        let server_token = self.server_token;
        let Some(group) = self.groups.get_mut(group_id) else {
            return false;
        };
        let Some(member) = group.members.remove(&connection) else {
            return false;
        };
        group.last_activity = ctx.now;
        tracing::debug!(%member, size = group.members.len(), "member left");

        if group.members.is_empty() {
            if let Some(group) = self.groups.remove(group_id) {
                self.close(ctx, group);
            }
            return true;
        }

        // The departure shrinks the set every open sync point waits for, but it
        // never resolves one by itself.
        let fields = group.fields();
        for sync_point in group.sync_points.values_mut() {
            sync_point.depart(connection);
            ctx.broadcast(
                sync_point.arrived_connections().collect::<Vec<_>>(),
                SyncNotify {
                    sender: server_token,
                    group: fields.clone(),
                    members: MemberList(sync_point.arrived_members()),
                    sync_point: sync_point.id().clone(),
                    code: SyncNotifyCode::Leave,
                },
            );
        }

        ctx.broadcast(
            group.members.keys().copied().collect::<Vec<_>>(),
            GroupNotify {
                sender: server_token,
                group: fields,
                members: MemberList(group.member_list()),
                code: GroupNotifyCode::Leave,
            },
        );
        true
    }

    /// Closes the group, notifying participants of open sync points and the
    /// remaining members.
    fn close(&self, ctx: &mut Context, group: Group) {
        tracing::debug!(group = %group.id, size = group.members.len(), "close group");
        let fields = group.fields();

        for sync_point in group.sync_points.values() {
            ctx.scheduler.cancel(sync_point.event());
            ctx.broadcast(
                sync_point.arrived_connections().collect::<Vec<_>>(),
                SyncNotify {
                    sender: self.server_token,
                    group: fields.clone(),
                    members: MemberList(sync_point.arrived_members()),
                    sync_point: sync_point.id().clone(),
                    code: SyncNotifyCode::Close,
                },
            );
        }

        ctx.broadcast(
            group.members.keys().copied().collect::<Vec<_>>(),
            GroupNotify {
                sender: self.server_token,
                group: fields,
                members: MemberList::default(),
                code: GroupNotifyCode::Close,
            },
        );
    }

    /// Registers the connection's arrival at a sync point.
    ///
    /// The first arrival creates the sync point and arms its timeout. The
    /// arrival that completes the group's current membership replaces the
    /// timeout by an immediate resolution event.
    #[tracing::instrument(
        skip(self, ctx, fields, sync),
        fields(group = %fields.group_id, sync_point = %sync.sync_point)
    )]
    pub fn sync(
        &mut self,
        ctx: &mut Context,
        connection: ConnectionId,
        fields: &GroupFields,
        sync: &SyncFields,
    ) -> SyncReply {
        let server_token = self.server_token;
        let group = match self.groups.get_mut(&fields.group_id) {
            Some(group) if group.accepts(connection, &fields.group_token) => group,
            _ => {
                tracing::debug!("sync rejected: not a member");
                return SyncReply::rejected(SyncCode::AuthenticationFailure);
            }
        };
        group.last_activity = ctx.now;

        let members = group.member_list();
        let name = &sync.sync_point;
        let (code, sync_point) = match group.sync_points.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let sync_point = entry.into_mut();
                if sync_point.has_arrived(connection) {
                    return SyncReply {
                        code: SyncCode::Joined,
                        time_left: sync_point.time_left(ctx.now),
                        members,
                    };
                }
                if sync_point.is_resolving() {
                    tracing::debug!("sync point already resolved");
                    return SyncReply {
                        members,
                        ..SyncReply::rejected(SyncCode::Expired)
                    };
                }
                (SyncCode::Joined, sync_point)
            }
            Entry::Vacant(entry) => {
                let timeout =
                    Duration::from_millis(sync.timeout.max(0) as u64).min(MAX_SYNC_TIMEOUT);
                let generation = self.next_generation;
                self.next_generation += 1;

                let event = ctx.scheduler.schedule(
                    ctx.now,
                    timeout,
                    ServerEvent::ResolveSync {
                        group: fields.group_id.clone(),
                        sync_point: name.clone(),
                        generation,
                        resolution: Resolution::Timeout,
                    },
                    false,
                );
                tracing::debug!(?timeout, generation, "create sync point");
                (
                    SyncCode::Created,
                    entry.insert(SyncPoint::new(
                        name.clone(),
                        generation,
                        ctx.now + timeout,
                        event,
                    )),
                )
            }
        };

        if let Some(member) = group.members.get(&connection) {
            sync_point.arrive(connection, member);
        }

        let group_fields = GroupFields {
            group_id: group.id.clone(),
            group_token: group.token,
        };
        ctx.broadcast(
            sync_point.arrived_connections().collect::<Vec<_>>(),
            SyncNotify {
                sender: server_token,
                group: group_fields,
                members: MemberList(sync_point.arrived_members()),
                sync_point: name.clone(),
                code: SyncNotifyCode::Join,
            },
        );

        if sync_point.is_complete(&group.members) {
            ctx.scheduler.cancel(sync_point.event());
            let resolution = ctx.scheduler.schedule(
                ctx.now,
                Duration::ZERO,
                ServerEvent::ResolveSync {
                    group: group.id.clone(),
                    sync_point: name.clone(),
                    generation: sync_point.generation(),
                    resolution: Resolution::Success,
                },
                false,
            );
            sync_point.begin_resolving(resolution);
            tracing::debug!("all members arrived");
        }

        SyncReply {
            code,
            time_left: sync_point.time_left(ctx.now),
            members,
        }
    }

    /// Resolves a sync point and notifies everybody who arrived at it.
    ///
    /// Events for sync points that no longer exist are ignored.
    pub fn resolve(
        &mut self,
        ctx: &mut Context,
        group_id: &NodeId,
        name: &NodeId,
        generation: u64,
        resolution: Resolution,
    ) {
        let Some(group) = self.groups.get_mut(group_id) else {
            return;
        };
        match group.sync_points.get(name) {
            Some(sync_point) if sync_point.generation() == generation => {}
            _ => {
                tracing::trace!(
                    group = %group_id,
                    sync_point = %name,
                    generation,
                    "stale sync event"
                );
                return;
            }
        }
        let Some(sync_point) = group.sync_points.remove(name) else {
            return;
        };

        tracing::debug!(
            group = %group_id,
            sync_point = %name,
            generation,
            ?resolution,
            arrived = sync_point.arrived_connections().count(),
            "resolve sync point"
        );

        ctx.broadcast(
            sync_point.arrived_connections().collect::<Vec<_>>(),
            SyncNotify {
                sender: self.server_token,
                group: group.fields(),
                members: MemberList(sync_point.arrived_members()),
                sync_point: name.clone(),
                code: match resolution {
                    Resolution::Success => SyncNotifyCode::Success,
                    Resolution::Timeout => SyncNotifyCode::Timeout,
                },
            },
        );
    }

    /// Closes every group that has been idle for longer than the idle timeout.
    pub fn housekeeping(&mut self, ctx: &mut Context) {
        let idle = self
            .groups
            .values()
            .filter(|group| {
                ctx.now.saturating_duration_since(group.last_activity) > self.idle_timeout
            })
            .map(|group| group.id.clone())
            .collect::<Vec<_>>();

        for group_id in idle {
            if let Some(group) = self.groups.remove(&group_id) {
                tracing::debug!(group = %group_id, "group idle");
                self.close(ctx, group);
            }
        }
    }

    pub fn handle_event(&mut self, ctx: &mut Context, event: ServerEvent) {
        match event {
            ServerEvent::Housekeeping => self.housekeeping(ctx),
            ServerEvent::ResolveSync {
                group,
                sync_point,
                generation,
                resolution,
            } => self.resolve(ctx, &group, &sync_point, generation, resolution),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    fn id(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn group(token: &str) -> GroupFields {
        GroupFields {
            group_id: id("group"),
            group_token: Token::from_secret(token),
        }
    }

    fn sync_fields(name: &str, timeout: i64) -> SyncFields {
        SyncFields {
            timeout,
            sync_point: id(name),
        }
    }

    struct Harness {
        registry: GroupRegistry,
        scheduler: EventScheduler<ServerEvent>,
        outgoing: Vec<Outgoing>,
        now: Instant,
    }

    macro_rules! ctx {
        ($harness:expr) => {
            &mut Context {
                now: $harness.now,
                scheduler: &mut $harness.scheduler,
                outgoing: &mut $harness.outgoing,
            }
        };
    }

    impl Harness {
        fn new(max_group_size: usize) -> Self {
            Self {
                registry: GroupRegistry::new(Token::random(), max_group_size, IDLE_TIMEOUT),
                scheduler: EventScheduler::default(),
                outgoing: Vec::new(),
                now: Instant::now(),
            }
        }

        fn join(&mut self, connection: ConnectionId, name: &str, token: &str) -> JoinCode {
            let fields = group(token);
            self.registry.join(ctx!(self), connection, &id(name), &fields)
        }

        fn leave(&mut self, connection: ConnectionId) -> bool {
            let fields = group("token");
            self.registry.leave(ctx!(self), connection, &fields)
        }

        fn sync(&mut self, connection: ConnectionId, name: &str, timeout: i64) -> SyncReply {
            let fields = group("token");
            self.registry
                .sync(ctx!(self), connection, &fields, &sync_fields(name, timeout))
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            while let Some(event) = self.scheduler.pop_due(self.now) {
                self.registry.handle_event(ctx!(self), event);
            }
        }

        fn take(&mut self) -> Vec<Outgoing> {
            std::mem::take(&mut self.outgoing)
        }
    }

    fn group_notifies(outgoing: &[Outgoing]) -> Vec<(ConnectionId, GroupNotifyCode, Vec<NodeId>)> {
        outgoing
            .iter()
            .filter_map(|o| match &o.packet.message {
                Message::GroupNotify(n) => Some((o.to, n.code, n.members.0.clone())),
                _ => None,
            })
            .collect()
    }

    fn sync_notifies(outgoing: &[Outgoing]) -> Vec<(ConnectionId, SyncNotifyCode)> {
        outgoing
            .iter()
            .filter_map(|o| match &o.packet.message {
                Message::SyncNotify(n) => Some((o.to, n.code)),
                _ => None,
            })
            .collect()
    }

    fn terminal(outgoing: &[Outgoing]) -> Vec<(ConnectionId, SyncNotifyCode)> {
        let mut notifies = sync_notifies(outgoing)
            .into_iter()
            .filter(|(_, code)| matches!(code, SyncNotifyCode::Success | SyncNotifyCode::Timeout))
            .collect::<Vec<_>>();
        notifies.sort_by_key(|(to, _)| *to);
        notifies
    }

    #[test]
    fn join_broadcasts_full_membership() {
        let mut h = Harness::new(3);
        assert_eq!(h.join(1, "a", "token"), JoinCode::Accepted);
        assert_eq!(group_notifies(&h.take()), [(1, GroupNotifyCode::Join, vec![id("a")])]);

        assert_eq!(h.join(2, "b", "token"), JoinCode::Accepted);
        let mut notifies = group_notifies(&h.take());
        notifies.sort_by_key(|(to, _, _)| *to);
        assert_eq!(
            notifies,
            [
                (1, GroupNotifyCode::Join, vec![id("a"), id("b")]),
                (2, GroupNotifyCode::Join, vec![id("a"), id("b")]),
            ]
        );
    }

    #[test]
    fn connection_membership_follows_join_and_leave() {
        let mut h = Harness::new(3);
        assert!(!h.registry.has_connection(1));
        h.join(1, "a", "token");
        assert!(h.registry.has_connection(1));
        assert!(!h.registry.has_connection(2));
        h.leave(1);
        assert!(!h.registry.has_connection(1));
    }

    #[test]
    fn rejoin_is_silent() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.take();
        assert_eq!(h.join(1, "a", "token"), JoinCode::Accepted);
        assert!(h.take().is_empty());
    }

    #[test]
    fn token_mismatch_does_not_mutate() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.take();
        assert_eq!(h.join(2, "b", "wrong"), JoinCode::AuthenticationFailure);
        assert!(h.take().is_empty());
        assert_eq!(h.registry.members(&id("group")), Some(vec![id("a")]));

        let reply = h.registry.sync(
            ctx!(h),
            1,
            &group("wrong"),
            &sync_fields("cp", 100),
        );
        assert_eq!(reply.code, SyncCode::AuthenticationFailure);
        assert_eq!(h.sync(2, "cp", 100).code, SyncCode::AuthenticationFailure);
    }

    #[test]
    fn full_group_rejects_join() {
        let mut h = Harness::new(3);
        for (connection, name) in [(1, "a"), (2, "b"), (3, "c")] {
            assert_eq!(h.join(connection, name, "token"), JoinCode::Accepted);
        }
        h.take();
        assert_eq!(h.join(4, "d", "token"), JoinCode::GroupFull);
        assert!(h.take().is_empty());
        assert_eq!(h.registry.members(&id("group")).unwrap().len(), 3);
    }

    #[test]
    fn last_leave_closes_group() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.take();

        assert!(h.leave(1));
        assert!(!h.leave(1));
        assert_eq!(group_notifies(&h.take()), [(2, GroupNotifyCode::Leave, vec![id("b")])]);

        h.registry.remove_connection(ctx!(h), 2);
        assert!(h.take().is_empty());
        assert_eq!(h.registry.len(), 0);
    }

    #[test]
    fn all_members_arriving_resolves_with_success() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.take();

        let first = h.sync(1, "cp1", 2000);
        assert_eq!(first.code, SyncCode::Created);
        assert_eq!(first.members, [id("a"), id("b")]);
        assert_eq!(first.time_left, Duration::from_millis(2000));
        assert_eq!(sync_notifies(&h.take()), [(1, SyncNotifyCode::Join)]);

        h.advance(Duration::from_millis(50));
        let second = h.sync(2, "cp1", 2000);
        assert_eq!(second.code, SyncCode::Joined);
        assert_eq!(second.time_left, Duration::from_millis(1950));

        // Resolution is queued, a late caller is told the sync point expired.
        h.join(3, "c", "token");
        assert_eq!(h.sync(3, "cp1", 2000).code, SyncCode::Expired);
        assert_eq!(h.sync(1, "cp1", 2000).code, SyncCode::Joined);
        h.take();

        h.advance(Duration::ZERO);
        assert_eq!(
            terminal(&h.take()),
            [(1, SyncNotifyCode::Success), (2, SyncNotifyCode::Success)]
        );

        // The timeout was cancelled.
        h.advance(Duration::from_secs(5));
        assert!(terminal(&h.take()).is_empty());
    }

    #[test]
    fn lone_arrival_times_out() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.sync(1, "cp1", 200);
        h.take();

        h.advance(Duration::from_millis(199));
        assert!(h.take().is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(terminal(&h.take()), [(1, SyncNotifyCode::Timeout)]);

        // A new sync point with the same name is independent.
        assert_eq!(h.sync(2, "cp1", 200).code, SyncCode::Created);
    }

    #[test]
    fn negative_timeout_is_zero() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        let reply = h.sync(1, "cp", -5);
        assert_eq!(reply.time_left, Duration::ZERO);
        h.take();
        h.advance(Duration::ZERO);
        assert_eq!(terminal(&h.take()), [(1, SyncNotifyCode::Timeout)]);
    }

    #[test]
    fn huge_timeout_is_capped() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        let reply = h.sync(1, "cp", i64::MAX);
        assert_eq!(reply.code, SyncCode::Created);
        assert_eq!(reply.time_left, MAX_SYNC_TIMEOUT);
        h.take();
        h.advance(Duration::from_secs(60));
        assert!(terminal(&h.take()).is_empty());
    }

    #[test]
    fn leave_shrinks_required_arrivals_without_resolving() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.join(3, "c", "token");
        h.sync(1, "cp1", 1000);
        h.take();

        // c leaves before arriving: a is told, nothing resolves.
        assert!(h.leave(3));
        let outgoing = h.take();
        assert_eq!(sync_notifies(&outgoing), [(1, SyncNotifyCode::Leave)]);
        h.advance(Duration::ZERO);
        assert!(terminal(&h.take()).is_empty());

        // b's arrival now completes the smaller membership.
        assert_eq!(h.sync(2, "cp1", 1000).code, SyncCode::Joined);
        h.advance(Duration::ZERO);
        assert_eq!(
            terminal(&h.take()),
            [(1, SyncNotifyCode::Success), (2, SyncNotifyCode::Success)]
        );
    }

    #[test]
    fn leave_after_remaining_members_arrived_resolves_by_timeout() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.join(3, "c", "token");
        h.sync(1, "cp1", 500);
        h.sync(2, "cp1", 500);
        assert!(h.leave(3));
        h.take();

        h.advance(Duration::from_millis(100));
        assert!(terminal(&h.take()).is_empty());
        h.advance(Duration::from_millis(400));
        assert_eq!(
            terminal(&h.take()),
            [(1, SyncNotifyCode::Timeout), (2, SyncNotifyCode::Timeout)]
        );
    }

    #[test]
    fn departed_arrival_is_not_notified() {
        let mut h = Harness::new(3);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.join(3, "c", "token");
        h.sync(1, "cp1", 100);
        h.sync(3, "cp1", 100);
        h.registry.remove_connection(ctx!(h), 3);
        h.take();

        h.advance(Duration::from_millis(100));
        assert_eq!(terminal(&h.take()), [(1, SyncNotifyCode::Timeout)]);
    }

    #[test]
    fn idle_groups_are_closed() {
        let mut h = Harness::new(3);
        h.scheduler
            .schedule(h.now, Duration::from_secs(1), ServerEvent::Housekeeping, true);
        h.join(1, "a", "token");
        h.join(2, "b", "token");
        h.sync(1, "cp1", 120_000);
        h.take();

        h.advance(IDLE_TIMEOUT);
        assert_eq!(h.registry.len(), 1);
        h.advance(Duration::from_secs(1));
        assert_eq!(h.registry.len(), 0);

        let outgoing = h.take();
        assert_eq!(sync_notifies(&outgoing), [(1, SyncNotifyCode::Close)]);
        let mut notifies = group_notifies(&outgoing);
        notifies.sort_by_key(|(to, _, _)| *to);
        assert_eq!(
            notifies,
            [
                (1, GroupNotifyCode::Close, vec![]),
                (2, GroupNotifyCode::Close, vec![]),
            ]
        );

        // The sync point's timeout was cancelled with the group.
        h.advance(Duration::from_secs(120));
        assert!(h.take().is_empty());
    }
}
