//! The replication protocols and their dispatch.
//!
//! Each protocol is a module implementing the same callback set — client-side
//! routing, state initialization, import/export, `update_state` on
//! reconfiguration, failure handling, and `handle_msg` — and the kernel
//! dispatches by matching on the configuration's [`ProtocolKind`] tag.
//! `handle_msg` consumes the messages the protocol owns and hands everything
//! else back to the kernel's built-in handlers.

pub(crate) mod chain;
pub(crate) mod primary_backup;
pub(crate) mod quorum;
pub(crate) mod single;

use crate::config::{Config, ProtocolKind};
use crate::mailbox::{Envelope, Id, Ref, ReplyTo};
use crate::replica::{ReplicaAddr, ReplicaMsg, Response};
use crate::sm::{CmdOutcome, Sm, StateMachine};
use crate::Error;
use ahash::AHashMap;

/// What the kernel lends a protocol for the duration of one message.
pub(crate) struct Ctx<'a, M: StateMachine> {
    pub me: &'a ReplicaAddr<M>,
    pub conf: &'a Config<M>,
    pub sm: &'a mut Sm<M>,
    /// The kernel's duplicate-suppression cache; protocols record the answer
    /// to every completed mutating request here.
    pub recent: &'a mut AHashMap<Ref, Response<M>>,
}

/// A protocol's private state, tagged by protocol.
pub(crate) enum ProtocolState<M: StateMachine> {
    Single,
    PrimaryBackup(primary_backup::State<M>),
    Chain(chain::State<M>),
    Quorum(quorum::State<M>),
}

/// The durable, address-free part of a protocol's state, as carried inside a
/// replica image.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub(crate) enum ProtocolImage {
    Single,
    PrimaryBackup { stable_count: u64, next_cmd_num: u64 },
    Chain,
    Quorum { updates_count: u64 },
}

impl<M: StateMachine> ProtocolState<M> {
    /// The neutral state a replica starts with before any configuration.
    pub fn init(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Single => ProtocolState::Single,
            ProtocolKind::PrimaryBackup => ProtocolState::PrimaryBackup(primary_backup::State::new()),
            ProtocolKind::Chain => ProtocolState::Chain(chain::State::new()),
            ProtocolKind::Quorum => ProtocolState::Quorum(quorum::State::new()),
        }
    }

    /// Rederives everything that depends on the replica set after a
    /// configuration change, preserving pending work.
    pub fn update_state(&mut self, me: &ReplicaAddr<M>, conf: &Config<M>) {
        match self {
            ProtocolState::Single => {}
            ProtocolState::PrimaryBackup(state) => primary_backup::update_state(state, me, conf),
            ProtocolState::Chain(state) => chain::update_state(state, me, conf),
            ProtocolState::Quorum(state) => quorum::update_state(state, me, conf),
        }
    }

    pub fn export(&self) -> ProtocolImage {
        match self {
            ProtocolState::Single => ProtocolImage::Single,
            ProtocolState::PrimaryBackup(state) => ProtocolImage::PrimaryBackup {
                stable_count: state.stable_count,
                next_cmd_num: state.next_cmd_num,
            },
            ProtocolState::Chain(_) => ProtocolImage::Chain,
            ProtocolState::Quorum(state) => ProtocolImage::Quorum {
                updates_count: state.updates_count,
            },
        }
    }

    pub fn import(kind: ProtocolKind, image: ProtocolImage) -> Self {
        let mut state = Self::init(kind);
        match (&mut state, image) {
            (ProtocolState::Single, ProtocolImage::Single) => {}
            (ProtocolState::Chain(_), ProtocolImage::Chain) => {}
            (
                ProtocolState::PrimaryBackup(state),
                ProtocolImage::PrimaryBackup { stable_count, next_cmd_num },
            ) => {
                state.stable_count = stable_count;
                state.next_cmd_num = next_cmd_num;
            }
            (ProtocolState::Quorum(state), ProtocolImage::Quorum { updates_count }) => {
                state.updates_count = updates_count;
            }
            (_, image) => {
                log::warn!("Image does not match protocol. Starting fresh. image={:?}", image);
            }
        }
        state
    }

    /// The state a forked replica starts with: pending tables move with the
    /// fork, everything replica-set-derived is rebuilt when it joins a
    /// configuration.
    pub fn forked(&self) -> Self {
        match self {
            ProtocolState::Single => ProtocolState::Single,
            ProtocolState::PrimaryBackup(state) => ProtocolState::PrimaryBackup(state.forked()),
            ProtocolState::Chain(state) => ProtocolState::Chain(state.forked()),
            ProtocolState::Quorum(state) => ProtocolState::Quorum(state.forked()),
        }
    }

    /// Routes a monitor's failure report to the protocol. Every protocol
    /// masks: a configuration change is the only way to remove a failed
    /// replica.
    pub fn handle_failure(
        me: &ReplicaAddr<M>,
        conf: Config<M>,
        state: Self,
        failed: Id,
        info: &str,
    ) -> (Config<M>, Self) {
        match state {
            ProtocolState::Single => single::handle_failure(me, conf, ProtocolState::Single, failed, info),
            ProtocolState::PrimaryBackup(state) => {
                let (conf, state) = primary_backup::handle_failure(me, conf, state, failed, info);
                (conf, ProtocolState::PrimaryBackup(state))
            }
            ProtocolState::Chain(state) => {
                let (conf, state) = chain::handle_failure(me, conf, state, failed, info);
                (conf, ProtocolState::Chain(state))
            }
            ProtocolState::Quorum(state) => {
                let (conf, state) = quorum::handle_failure(me, conf, state, failed, info);
                (conf, ProtocolState::Quorum(state))
            }
        }
    }

    /// Gives the protocol first crack at an inbound message. Returns the
    /// envelope untouched when the message is not the protocol's to handle.
    pub fn handle_msg(
        &mut self,
        ctx: Ctx<'_, M>,
        env: Envelope<ReplicaMsg<M>>,
    ) -> Option<Envelope<ReplicaMsg<M>>> {
        match self {
            ProtocolState::Single => single::handle_msg(ctx, env),
            ProtocolState::PrimaryBackup(state) => primary_backup::handle_msg(state, ctx, env),
            ProtocolState::Chain(state) => chain::handle_msg(state, ctx, env),
            ProtocolState::Quorum(state) => quorum::handle_msg(state, ctx, env),
        }
    }
}

/// Client-side routing: picks the replica the request identified by
/// `reference` should be sent to.
pub(crate) fn route<M: StateMachine>(
    conf: &Config<M>,
    reference: Ref,
    cmd: &M::Command,
) -> Result<ReplicaAddr<M>, Error> {
    match conf.replicas().first() {
        None => Err(Error::NoReplicas),
        Some(first) => Ok(match conf.protocol() {
            ProtocolKind::Single => first.clone(),
            ProtocolKind::PrimaryBackup => primary_backup::route(conf, cmd),
            ProtocolKind::Chain => chain::route(conf, cmd),
            ProtocolKind::Quorum => quorum::route(conf, reference),
        }),
    }
}

/// Maps a command outcome onto the response the client sees. `NoReply`
/// answers nobody.
pub(crate) fn reply_for<M: StateMachine>(outcome: CmdOutcome<M::Reply>) -> Option<Response<M>> {
    match outcome {
        CmdOutcome::Reply(reply) => Some(Response::Cmd(Ok(reply))),
        CmdOutcome::Unknown => Some(Response::Cmd(Err(Error::UnknownCommand))),
        CmdOutcome::NoReply => None,
    }
}

/// The direct-reply form of command execution: run the command on the local
/// machine and answer the client straight away. Returns what was sent so
/// callers can cache it.
pub(crate) fn respond<M: StateMachine>(
    sm: &mut Sm<M>,
    me: Id,
    reference: Ref,
    client: &ReplyTo<Response<M>>,
    cmd: &M::Command,
    side_effects: bool,
) -> Option<Response<M>> {
    let resp = reply_for::<M>(sm.do_cmd(cmd, side_effects))?;
    if !client.reply(reference, me, resp.clone()) {
        log::debug!("Requester is gone. Dropping reply. ref={:?}", reference);
    }
    Some(resp)
}
