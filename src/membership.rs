use std::{
    collections::BTreeSet,
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    client::{ClientShared, SendError},
    id::{NodeId, Token},
    message::{GroupFields, JoinRequest, LeaveRequest, Packet, SyncFields, SyncRequest},
    protocol::{GroupNotifyCode, JoinCode, SequenceNumber, SyncCode, SyncNotifyCode},
    utils::{lock, wait_timeout, StopWatch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Threshold {
    AtLeast(usize),
    EqualTo(usize),
    LessThan(usize),
}

/// A condition on the number of members of a group, see
/// [`Group::wait_members`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberCount(Threshold);

impl MemberCount {
    /// Satisfied by `count` or more members.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn at_least(count: usize) -> Self {
        assert!(count >= 1, "a joined group has at least one member");
        Self(Threshold::AtLeast(count))
    }

    /// Satisfied by exactly `count` members.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn equal_to(count: usize) -> Self {
        assert!(count >= 1, "a joined group has at least one member");
        Self(Threshold::EqualTo(count))
    }

    /// Satisfied by fewer than `count` members.
    ///
    /// # Panics
    ///
    /// Panics if `count` is less than two.
    pub fn less_than(count: usize) -> Self {
        assert!(count >= 2, "a joined group has at least one member");
        Self(Threshold::LessThan(count))
    }

    pub fn matches(&self, members: usize) -> bool {
        match self.0 {
            Threshold::AtLeast(count) => members >= count,
            Threshold::EqualTo(count) => members == count,
            Threshold::LessThan(count) => members < count,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("Group is full")]
    GroupFull,

    #[error("Group token rejected")]
    AuthenticationFailed,

    #[error("Join timed out")]
    Timeout,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Failed to send join request: {0}")]
    Send(io::Error),

    /// Leaving the group to re-join it with another token failed.
    #[error("Failed to leave group: {0}")]
    Leave(#[from] LeaveError),
}

#[derive(thiserror::Error, Debug)]
pub enum LeaveError {
    #[error("Leave timed out")]
    Timeout,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Failed to send leave request: {0}")]
    Send(io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("Not a member of the group")]
    NotJoined,

    /// Another thread is already waiting on a sync point of this group.
    #[error("Already waiting on a sync point")]
    AlreadyWaiting,

    /// The sync point was resolved before the request arrived.
    #[error("Sync point expired")]
    Expired,

    #[error("Group token rejected")]
    AuthenticationFailed,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Failed to send sync request: {0}")]
    Send(io::Error),
}

macro_rules! impl_from_send_error {
    ($($error:ident),+) => {
        $(
            impl From<SendError> for $error {
                fn from(err: SendError) -> Self {
                    match err {
                        SendError::NotConnected => Self::NotConnected,
                        SendError::Io(err) => Self::Send(err),
                    }
                }
            }
        )+
    };
}

impl_from_send_error!(JoinError, LeaveError, SyncError);

#[derive(Debug, Clone, Copy)]
enum Reply {
    Join(JoinCode),
    Leave,
    Lost,
}

#[derive(Debug)]
struct RequestState {
    token: Token,
    /// Sequence number of the join or leave request in flight.
    awaiting: Option<SequenceNumber>,
    reply: Option<Reply>,
}

#[derive(Debug, Clone, Copy)]
enum SyncOutcome {
    Success,
    Timeout,
    Left,
    Expired,
    Rejected,
}

#[derive(Debug, Default)]
struct SyncWait {
    sync_point: Option<NodeId>,
    seq: Option<SequenceNumber>,
    /// The server answered the request, notifications now refer to it.
    acknowledged: bool,
    outcome: Option<SyncOutcome>,
}

/// Client-side state of a group, updated by the network thread.
///
/// Locks are taken in the order `request`, `members`, `sync`.
#[derive(Debug)]
pub(crate) struct GroupState {
    id: NodeId,
    operation: Mutex<()>,
    request: Mutex<RequestState>,
    answered: Condvar,
    /// `None` while not joined.
    members: Mutex<Option<BTreeSet<NodeId>>>,
    members_updated: Condvar,
    sync: Mutex<SyncWait>,
    sync_updated: Condvar,
}

impl GroupState {
    pub fn new(id: NodeId, token: Token) -> Self {
        Self {
            id,
            operation: Mutex::new(()),
            request: Mutex::new(RequestState {
                token,
                awaiting: None,
                reply: None,
            }),
            answered: Condvar::new(),
            members: Mutex::new(None),
            members_updated: Condvar::new(),
            sync: Mutex::new(SyncWait::default()),
            sync_updated: Condvar::new(),
        }
    }

    pub fn token(&self) -> Token {
        lock(&self.request).token
    }

    fn is_joined(&self) -> bool {
        lock(&self.members).is_some()
    }

    pub fn join_answered(&self, seq: SequenceNumber, code: JoinCode, own_id: &NodeId) {
        let request = lock(&self.request);
        if request.awaiting != Some(seq) {
            tracing::debug!(group = %self.id, seq, "ignoring stale join response");
            return;
        }
        if code == JoinCode::Accepted {
            lock(&self.members)
                .get_or_insert_with(BTreeSet::new)
                .insert(own_id.clone());
            self.members_updated.notify_all();
        }
        self.finish_request(request, Reply::Join(code));
    }

    pub fn leave_answered(&self, seq: SequenceNumber) {
        let request = lock(&self.request);
        if request.awaiting != Some(seq) {
            tracing::debug!(group = %self.id, seq, "ignoring stale leave response");
            return;
        }
        self.lose_membership();
        self.finish_request(request, Reply::Leave);
    }

    pub fn members_changed(&self, code: GroupNotifyCode, members: &[NodeId], own_id: &NodeId) {
        if code != GroupNotifyCode::Close && members.contains(own_id) {
            *lock(&self.members) = Some(members.iter().cloned().collect());
            self.members_updated.notify_all();
            return;
        }

        tracing::debug!(group = %self.id, ?code, "membership ended by server");
        self.lose_membership();
        // A leave in progress waits for the membership to end.
        let _request = lock(&self.request);
        self.answered.notify_all();
    }

    pub fn sync_answered(&self, seq: SequenceNumber, sync_point: &NodeId, code: SyncCode) {
        let mut sync = lock(&self.sync);
        if sync.seq != Some(seq) || sync.sync_point.as_ref() != Some(sync_point) {
            return;
        }
        match code {
            SyncCode::Created | SyncCode::Joined => sync.acknowledged = true,
            SyncCode::Expired => sync.outcome = Some(SyncOutcome::Expired),
            SyncCode::AuthenticationFailure => sync.outcome = Some(SyncOutcome::Rejected),
        }
        self.sync_updated.notify_all();
    }

    pub fn sync_notified(&self, sync_point: &NodeId, code: SyncNotifyCode) {
        let outcome = match code {
            SyncNotifyCode::Success => SyncOutcome::Success,
            SyncNotifyCode::Timeout => SyncOutcome::Timeout,
            SyncNotifyCode::Close => SyncOutcome::Left,
            SyncNotifyCode::Join | SyncNotifyCode::Leave => return,
        };
        let mut sync = lock(&self.sync);
        if !sync.acknowledged
            || sync.outcome.is_some()
            || sync.sync_point.as_ref() != Some(sync_point)
        {
            return;
        }
        sync.outcome = Some(outcome);
        self.sync_updated.notify_all();
    }

    /// Ends every wait after the connection to the server is gone.
    pub fn connection_lost(&self) {
        let mut request = lock(&self.request);
        if request.awaiting.take().is_some() {
            request.reply = Some(Reply::Lost);
        }
        self.lose_membership();
        self.answered.notify_all();
    }

    fn finish_request(&self, mut request: MutexGuard<'_, RequestState>, reply: Reply) {
        request.awaiting = None;
        request.reply = Some(reply);
        self.answered.notify_all();
    }

    fn lose_membership(&self) {
        lock(&self.members).take();
        self.members_updated.notify_all();

        let mut sync = lock(&self.sync);
        if sync.sync_point.is_some() && sync.outcome.is_none() {
            sync.outcome = Some(SyncOutcome::Left);
        }
        self.sync_updated.notify_all();
    }

    /// Waits for the answer to `seq` or until `stop` returns true.
    fn wait_reply(
        &self,
        seq: SequenceNumber,
        timeout: Duration,
        stop: impl Fn(&Self) -> bool,
    ) -> Option<Reply> {
        let stop_watch = StopWatch::start(timeout);
        let mut request = lock(&self.request);
        let reply = loop {
            if let Some(reply) = request.reply.take() {
                break Some(reply);
            }
            if stop(self) || !stop_watch.has_time_left() {
                break None;
            }
            request = wait_timeout(&self.answered, request, stop_watch.time_left());
        };
        if request.awaiting == Some(seq) {
            request.awaiting = None;
        }
        reply
    }
}

/// Resets the sync wait of a group when a [`Group::wait_sync`] call ends.
struct SyncWaitGuard<'a>(&'a GroupState);

impl Drop for SyncWaitGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.sync) = SyncWait::default();
    }
}

/// A group as seen by a [`Client`](crate::Client).
///
/// Handles are cheap to clone and refer to the same client-side state, so
/// they can be shared between threads. Join and leave are serialized per
/// group; [`Group::wait_members`] and [`Group::wait_sync`] may be called
/// while another thread joins or leaves.
#[derive(Clone)]
pub struct Group {
    client: Arc<ClientShared>,
    state: Arc<GroupState>,
}

impl Group {
    pub(crate) fn new(client: Arc<ClientShared>, state: Arc<GroupState>) -> Self {
        Self { client, state }
    }

    pub fn id(&self) -> &NodeId {
        &self.state.id
    }

    /// The token used for the last join of this group.
    pub fn token(&self) -> Token {
        self.state.token()
    }

    pub fn is_joined(&self) -> bool {
        self.state.is_joined()
    }

    /// The current members, sorted. Empty while not joined.
    pub fn members(&self) -> Vec<NodeId> {
        lock(&self.state.members)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn contains(&self, member: &NodeId) -> bool {
        lock(&self.state.members)
            .as_ref()
            .is_some_and(|members| members.contains(member))
    }

    fn group_fields(&self) -> GroupFields {
        GroupFields {
            group_id: self.state.id.clone(),
            group_token: self.token(),
        }
    }

    /// Joins the group with its current token.
    ///
    /// Joining a group that is already joined does nothing.
    pub fn join(&self) -> Result<(), JoinError> {
        self.join_with(self.token())
    }

    #[tracing::instrument(skip_all, fields(group = %self.state.id))]
    pub(crate) fn join_with(&self, token: Token) -> Result<(), JoinError> {
        let _operation = lock(&self.state.operation);
        if self.is_joined() {
            if self.token() == token {
                return Ok(());
            }
            tracing::debug!("leaving to re-join with another token");
            self.leave_locked()?;
        }

        let request = Packet::new(JoinRequest {
            sender: self.client.token(),
            group: GroupFields {
                group_id: self.state.id.clone(),
                group_token: token,
            },
        });
        let seq = request.seq();
        {
            let mut state = lock(&self.state.request);
            state.token = token;
            state.awaiting = Some(seq);
            state.reply = None;
        }
        if let Err(err) = self.client.send(&request) {
            lock(&self.state.request).awaiting = None;
            return Err(err.into());
        }

        let timeout = self.client.config.group_message_timeout;
        match self.state.wait_reply(seq, timeout, |_| false) {
            Some(Reply::Join(JoinCode::Accepted)) => {
                tracing::debug!("joined");
                Ok(())
            }
            Some(Reply::Join(JoinCode::GroupFull)) => Err(JoinError::GroupFull),
            Some(Reply::Join(JoinCode::AuthenticationFailure)) => {
                Err(JoinError::AuthenticationFailed)
            }
            Some(Reply::Lost) => Err(JoinError::NotConnected),
            // Only the answer to `seq` is stored.
            Some(Reply::Leave) | None => {
                self.client.cancel(seq);
                Err(JoinError::Timeout)
            }
        }
    }

    /// Leaves the group.
    ///
    /// Leaving a group that is not joined does nothing.
    #[tracing::instrument(skip_all, fields(group = %self.state.id))]
    pub fn leave(&self) -> Result<(), LeaveError> {
        let _operation = lock(&self.state.operation);
        self.leave_locked()
    }

    fn leave_locked(&self) -> Result<(), LeaveError> {
        if !self.is_joined() {
            return Ok(());
        }

        let request = Packet::new(LeaveRequest {
            sender: self.client.token(),
            group: self.group_fields(),
        });
        let seq = request.seq();
        {
            let mut state = lock(&self.state.request);
            state.awaiting = Some(seq);
            state.reply = None;
        }
        if let Err(err) = self.client.send(&request) {
            lock(&self.state.request).awaiting = None;
            return Err(err.into());
        }

        let timeout = self.client.config.group_message_timeout;
        let reply = self
            .state
            .wait_reply(seq, timeout, |state| !state.is_joined());
        self.client.cancel(seq);

        match reply {
            Some(Reply::Leave) | Some(Reply::Lost) => Ok(()),
            _ if !self.is_joined() => Ok(()),
            _ => Err(LeaveError::Timeout),
        }
    }

    /// Waits until the number of members matches `count`.
    ///
    /// Returns false if the timeout elapses or the membership ends while
    /// waiting.
    #[tracing::instrument(skip(self), fields(group = %self.state.id))]
    pub fn wait_members(&self, count: MemberCount, timeout: Duration) -> Result<bool, SyncError> {
        let stop_watch = StopWatch::start(timeout);
        let mut members = lock(&self.state.members);
        if members.is_none() {
            return Err(SyncError::NotJoined);
        }
        loop {
            match &*members {
                None => return Ok(false),
                Some(members) if count.matches(members.len()) => return Ok(true),
                Some(_) => {}
            }
            if !stop_watch.has_time_left() {
                return Ok(false);
            }
            members = wait_timeout(&self.state.members_updated, members, stop_watch.time_left());
        }
    }

    /// Waits until every member of the group reached the sync point `name`.
    ///
    /// Returns true if all members arrived before the timeout and false if
    /// the sync point timed out or the membership ended while waiting. Only
    /// one thread at a time may wait on a sync point of a group.
    #[tracing::instrument(skip(self), fields(group = %self.state.id))]
    pub fn wait_sync(&self, name: &NodeId, timeout: Duration) -> Result<bool, SyncError> {
        {
            let members = lock(&self.state.members);
            if members.is_none() {
                return Err(SyncError::NotJoined);
            }
            let mut sync = lock(&self.state.sync);
            if sync.sync_point.is_some() {
                return Err(SyncError::AlreadyWaiting);
            }
            sync.sync_point = Some(name.clone());
        }
        let _guard = SyncWaitGuard(&self.state);

        let request = Packet::new(SyncRequest {
            sender: self.client.token(),
            group: self.group_fields(),
            sync: SyncFields {
                timeout: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
                sync_point: name.clone(),
            },
        });
        let seq = request.seq();
        lock(&self.state.sync).seq = Some(seq);
        self.client.send(&request)?;

        let budget = timeout.saturating_add(self.client.config.sync_extra_latency);
        let stop_watch = StopWatch::start(budget);
        let mut sync = lock(&self.state.sync);
        let outcome = loop {
            if let Some(outcome) = sync.outcome {
                break outcome;
            }
            if !stop_watch.has_time_left() {
                tracing::debug!("no resolution received in time");
                break SyncOutcome::Timeout;
            }
            sync = wait_timeout(&self.state.sync_updated, sync, stop_watch.time_left());
        };
        drop(sync);
        self.client.cancel(seq);

        tracing::debug!(?outcome, "sync point finished");
        match outcome {
            SyncOutcome::Success => Ok(true),
            SyncOutcome::Timeout | SyncOutcome::Left => Ok(false),
            SyncOutcome::Expired => Err(SyncError::Expired),
            SyncOutcome::Rejected => Err(SyncError::AuthenticationFailed),
        }
    }
}
