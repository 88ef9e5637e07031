//! Primary/backup replication.
//!
//! Replicas are ordered: the head of the configuration is the primary, the
//! rest are backups. A mutating command is accepted only by the primary,
//! which numbers it, records it in the unstable table, and replicates it to
//! every backup. Each backup applies it and acknowledges; once every backup
//! has stabilized a command the primary applies it too and answers the
//! client. Mutations therefore commit in command-number order at every
//! replica (the transport is FIFO per link), and the primary only ever
//! answers from state every backup already has.
//!
//! Non-mutating commands are served locally by whichever replica the
//! configured read source points the client at. A read served by a backup can
//! trail the primary's unstable window, never more.

use crate::config::{Config, ReadSource};
use crate::mailbox::{self, Envelope, Id, Ref, ReplyTo};
use crate::protocol::{respond, Ctx};
use crate::replica::{ReplicaAddr, ReplicaMsg, Response};
use crate::sm::StateMachine;
use crate::Error;
use ahash::AHashMap;
use rand::Rng;

/// A mutation the primary has replicated but not yet answered.
pub(crate) struct Pending<M: StateMachine> {
    pub remaining: usize,
    pub reference: Ref,
    pub client: ReplyTo<Response<M>>,
    pub cmd: M::Command,
}

impl<M: StateMachine> Clone for Pending<M> {
    fn clone(&self) -> Self {
        Pending {
            remaining: self.remaining,
            reference: self.reference,
            client: self.client.clone(),
            cmd: self.cmd.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Role {
    Primary,
    Backup,
}

pub(crate) struct State<M: StateMachine> {
    pub role: Role,
    /// The backups this replica replicates to. Empty unless primary.
    pub backups: Vec<ReplicaAddr<M>>,
    /// Mutations awaiting backup acknowledgements, keyed by command number.
    pub unstable: AHashMap<u64, Pending<M>>,
    pub stable_count: u64,
    pub next_cmd_num: u64,
}

impl<M: StateMachine> State<M> {
    pub fn new() -> Self {
        State {
            role: Role::Backup,
            backups: Vec::new(),
            unstable: AHashMap::new(),
            stable_count: 0,
            next_cmd_num: 0,
        }
    }

    pub fn forked(&self) -> Self {
        State {
            role: Role::Backup,
            backups: Vec::new(),
            unstable: self.unstable.clone(),
            stable_count: self.stable_count,
            next_cmd_num: self.next_cmd_num,
        }
    }
}

pub(crate) fn update_state<M: StateMachine>(
    state: &mut State<M>,
    me: &ReplicaAddr<M>,
    conf: &Config<M>,
) {
    let replicas = conf.replicas();
    if replicas.first().map(|addr| addr.id()) == Some(me.id()) {
        state.role = Role::Primary;
        state.backups = replicas[1..].to_vec();
    } else {
        state.role = Role::Backup;
        state.backups = Vec::new();
    }
}

/// Mutations go to the primary; reads go wherever the configured read source
/// points.
pub(crate) fn route<M: StateMachine>(conf: &Config<M>, cmd: &M::Command) -> ReplicaAddr<M> {
    let replicas = conf.replicas();
    if M::is_mutating(cmd) {
        return replicas[0].clone();
    }
    match conf.read_src() {
        ReadSource::Primary => replicas[0].clone(),
        ReadSource::Backup if replicas.len() > 1 => {
            replicas[rand::thread_rng().gen_range(1..replicas.len())].clone()
        }
        ReadSource::Backup => replicas[0].clone(),
        ReadSource::Random => replicas[rand::thread_rng().gen_range(0..replicas.len())].clone(),
    }
}

pub(crate) fn handle_msg<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    env: Envelope<ReplicaMsg<M>>,
) -> Option<Envelope<ReplicaMsg<M>>> {
    match env.msg {
        ReplicaMsg::Cmd { client, cmd, .. } => {
            handle_cmd(state, ctx, env.reference, client, cmd);
            None
        }
        ReplicaMsg::Replicate { primary, num, cmd } => {
            handle_replicate(state, ctx, primary, num, cmd);
            None
        }
        ReplicaMsg::Stabilized { num } => {
            handle_stabilized(state, ctx, num);
            None
        }
        msg => Some(Envelope { reference: env.reference, msg }),
    }
}

fn handle_cmd<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    reference: Ref,
    client: ReplyTo<Response<M>>,
    cmd: M::Command,
) {
    if !M::is_mutating(&cmd) {
        respond(ctx.sm, ctx.me.id(), reference, &client, &cmd, true);
        return;
    }
    if state.role != Role::Primary {
        log::debug!(
            "Mutating command at a backup. Rejecting. id={}, cmd={:?}",
            ctx.me.id(),
            cmd
        );
        client.reply(reference, ctx.me.id(), Response::Cmd(Err(Error::NotInConfiguration)));
        return;
    }
    // A retransmission of a mutation still in flight.
    if state.unstable.values().any(|pending| pending.reference == reference) {
        log::debug!("Mutation already in flight. id={}, ref={:?}", ctx.me.id(), reference);
        return;
    }
    if state.backups.is_empty() {
        if let Some(resp) = respond(ctx.sm, ctx.me.id(), reference, &client, &cmd, true) {
            ctx.recent.insert(reference, resp);
        }
        state.next_cmd_num += 1;
        state.stable_count += 1;
        return;
    }
    let num = state.next_cmd_num;
    state.next_cmd_num += 1;
    state.unstable.insert(
        num,
        Pending { remaining: state.backups.len(), reference, client, cmd: cmd.clone() },
    );
    mailbox::multicast(
        &state.backups,
        &ReplicaMsg::Replicate { primary: ctx.me.clone(), num, cmd },
    );
}

fn handle_replicate<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    primary: ReplicaAddr<M>,
    num: u64,
    cmd: M::Command,
) {
    if num < state.next_cmd_num {
        log::debug!(
            "Stale replication. Dropping. id={}, num={}, next={}",
            ctx.me.id(),
            num,
            state.next_cmd_num
        );
        return;
    }
    if num > state.next_cmd_num {
        // FIFO links make this unreachable barring a transport defect.
        log::warn!(
            "Replication gap. id={}, num={}, next={}",
            ctx.me.id(),
            num,
            state.next_cmd_num
        );
    }
    ctx.sm.do_cmd(&cmd, true);
    state.next_cmd_num = num + 1;
    state.stable_count = num + 1;
    mailbox::cast(&primary, ReplicaMsg::Stabilized { num });
}

fn handle_stabilized<M: StateMachine>(state: &mut State<M>, ctx: Ctx<'_, M>, num: u64) {
    let done = match state.unstable.get_mut(&num) {
        None => {
            log::debug!("Late stabilization. Dropping. id={}, num={}", ctx.me.id(), num);
            return;
        }
        Some(pending) => {
            pending.remaining = pending.remaining.saturating_sub(1);
            pending.remaining == 0
        }
    };
    if !done {
        return;
    }
    if let Some(pending) = state.unstable.remove(&num) {
        if let Some(resp) = respond(
            ctx.sm,
            ctx.me.id(),
            pending.reference,
            &pending.client,
            &pending.cmd,
            true,
        ) {
            ctx.recent.insert(pending.reference, resp);
        }
        state.stable_count += 1;
    }
}

pub(crate) fn handle_failure<M: StateMachine>(
    me: &ReplicaAddr<M>,
    conf: Config<M>,
    state: State<M>,
    failed: Id,
    info: &str,
) -> (Config<M>, State<M>) {
    log::info!("Masking peer failure. id={}, failed={}, info={}", me.id(), failed, info);
    (conf, state)
}
