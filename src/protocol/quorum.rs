//! Quorum replication.
//!
//! Any replica can coordinate a command. The coordinator records a pending
//! operation, asks every other replica to execute, and completes once a
//! read or write quorum of members (itself included) has answered. Each
//! answer carries the responder's update count; the coordinator reconciles
//! by count and hands the client the freshest result seen among the quorum
//! and itself. With `r + w > n`, every read quorum overlaps every write
//! quorum, so a read reflects the latest completed write.
//!
//! Peers execute reads without side effects (shadow execution) and may
//! re-execute them on a retransmission; a duplicate write is answered from
//! the per-`Ref` reply cache without touching the state again.

use crate::config::Config;
use crate::mailbox::{Envelope, Id, Ref, ReplyTo};
use crate::protocol::{reply_for, respond, Ctx};
use crate::replica::{QTag, ReplicaAddr, ReplicaMsg, Response};
use crate::sm::{CmdOutcome, StateMachine};
use ahash::AHashMap;

/// A coordinated command still gathering peer answers.
pub(crate) struct Pending<M: StateMachine> {
    pub client: ReplyTo<Response<M>>,
    pub cmd: M::Command,
    pub write: bool,
    /// Answers still needed to reach the quorum.
    pub rem_responses: usize,
    /// Peers that have not answered at all; the entry is dropped when this
    /// reaches zero.
    pub rem_replicas: usize,
    pub max_count: u64,
    pub max_result: Option<CmdOutcome<M::Reply>>,
    /// The quorum completed and the client was answered; stragglers only
    /// retire the entry.
    pub done: bool,
}

impl<M: StateMachine> Clone for Pending<M> {
    fn clone(&self) -> Self {
        Pending {
            client: self.client.clone(),
            cmd: self.cmd.clone(),
            write: self.write,
            rem_responses: self.rem_responses,
            rem_replicas: self.rem_replicas,
            max_count: self.max_count,
            max_result: self.max_result.clone(),
            done: self.done,
        }
    }
}

pub(crate) struct State<M: StateMachine> {
    pub n: usize,
    pub r: usize,
    pub w: usize,
    pub others: Vec<ReplicaAddr<M>>,
    /// Coordinator-side pending operations keyed by request token.
    pub unstable: AHashMap<Ref, Pending<M>>,
    /// How many writes this replica has applied.
    pub updates_count: u64,
    /// Peer-side answers to writes, so a retransmitted write is idempotent.
    pub write_replies: AHashMap<Ref, (u64, CmdOutcome<M::Reply>)>,
}

impl<M: StateMachine> State<M> {
    pub fn new() -> Self {
        State {
            n: 1,
            r: 1,
            w: 1,
            others: Vec::new(),
            unstable: AHashMap::new(),
            updates_count: 0,
            write_replies: AHashMap::new(),
        }
    }

    pub fn forked(&self) -> Self {
        State {
            n: 1,
            r: 1,
            w: 1,
            others: Vec::new(),
            unstable: self.unstable.clone(),
            updates_count: self.updates_count,
            write_replies: self.write_replies.clone(),
        }
    }
}

pub(crate) fn update_state<M: StateMachine>(
    state: &mut State<M>,
    me: &ReplicaAddr<M>,
    conf: &Config<M>,
) {
    state.n = conf.replicas().len();
    let (r, w) = conf.quorum_sizes();
    state.r = r;
    state.w = w;
    state.others = conf
        .replicas()
        .iter()
        .filter(|addr| addr.id() != me.id())
        .cloned()
        .collect();
    // Completed operations linger only to absorb stragglers; a new
    // configuration resets who could still answer.
    state.unstable.retain(|_, pending| !pending.done);
}

/// The caller picks the coordinator: the first replica, or — when the
/// configuration shuffles coordination — the one the request token rotates
/// onto. A token always maps to the same coordinator, so a retransmission
/// reaches the replica already holding its pending operation.
pub(crate) fn route<M: StateMachine>(conf: &Config<M>, reference: Ref) -> ReplicaAddr<M> {
    let replicas = conf.replicas();
    if conf.shuffle() {
        replicas[reference.slot(replicas.len())].clone()
    } else {
        replicas[0].clone()
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
        ReplicaMsg::QuorumReq { coord, qtag, cmd } => {
            handle_req(state, ctx, env.reference, coord, qtag, cmd);
            None
        }
        ReplicaMsg::QuorumAck { from, count, result } => {
            handle_ack(state, ctx, env.reference, from, count, result);
            None
        }
        msg => Some(Envelope { reference: env.reference, msg }),
    }
}

/// Coordinator path: open a pending operation and fan the command out.
fn handle_cmd<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    reference: Ref,
    client: ReplyTo<Response<M>>,
    cmd: M::Command,
) {
    if state.unstable.contains_key(&reference) {
        log::debug!("Operation already pending. id={}, ref={:?}", ctx.me.id(), reference);
        return;
    }
    let write = M::is_mutating(&cmd);
    let qsize = if write { state.w } else { state.r };
    if qsize <= 1 {
        // A quorum of one degenerates to local execution.
        if write {
            state.updates_count += 1;
        }
        if let Some(resp) = respond(ctx.sm, ctx.me.id(), reference, &client, &cmd, true) {
            if write {
                ctx.recent.insert(reference, resp);
            }
        }
        return;
    }
    state.unstable.insert(
        reference,
        Pending {
            client,
            cmd: cmd.clone(),
            write,
            rem_responses: qsize - 1,
            rem_replicas: state.n.saturating_sub(1),
            max_count: 0,
            max_result: None,
            done: false,
        },
    );
    let qtag = if write { QTag::Write } else { QTag::Read };
    for peer in &state.others {
        let delivered = peer.deliver(Envelope {
            reference,
            msg: ReplicaMsg::QuorumReq { coord: ctx.me.clone(), qtag, cmd: cmd.clone() },
        });
        if !delivered {
            log::debug!("Peer is gone. id={}, peer={}, ref={:?}", ctx.me.id(), peer.id(), reference);
        }
    }
}

/// Peer path: execute for a coordinator and answer with the local update
/// count.
fn handle_req<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    reference: Ref,
    coord: ReplicaAddr<M>,
    qtag: QTag,
    cmd: M::Command,
) {
    let (count, result) = match qtag {
        // Shadow execution: compute the answer without externally visible
        // effects. Re-running a retransmitted read is harmless.
        QTag::Read => (state.updates_count, ctx.sm.do_cmd(&cmd, false)),
        QTag::Write => match state.write_replies.get(&reference) {
            Some((count, result)) => {
                log::debug!("Duplicate write. Replying from cache. id={}, ref={:?}", ctx.me.id(), reference);
                (*count, result.clone())
            }
            None => {
                state.updates_count += 1;
                let result = ctx.sm.do_cmd(&cmd, true);
                state.write_replies.insert(reference, (state.updates_count, result.clone()));
                (state.updates_count, result)
            }
        },
    };
    let delivered = coord.deliver(Envelope {
        reference,
        msg: ReplicaMsg::QuorumAck { from: ctx.me.id(), count, result },
    });
    if !delivered {
        log::debug!("Coordinator is gone. id={}, ref={:?}", ctx.me.id(), reference);
    }
}

/// Coordinator path: fold one peer answer into the pending operation; on
/// quorum, execute locally and answer with the freshest result.
fn handle_ack<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    reference: Ref,
    from: Id,
    count: u64,
    result: CmdOutcome<M::Reply>,
) {
    let completed_now = match state.unstable.get_mut(&reference) {
        None => {
            log::debug!("Late answer. Dropping. id={}, from={}, ref={:?}", ctx.me.id(), from, reference);
            return;
        }
        Some(pending) => {
            // Keep the freshest result; ties keep the earlier answer.
            if pending.max_result.is_none() || count > pending.max_count {
                pending.max_count = count;
                pending.max_result = Some(result);
            }
            if pending.rem_replicas > 0 {
                pending.rem_replicas -= 1;
            }
            if !pending.done && pending.rem_responses > 0 {
                pending.rem_responses -= 1;
                pending.rem_responses == 0
            } else {
                false
            }
        }
    };

    if completed_now {
        let (client, cmd, write, max_count, max_result) =
            match state.unstable.get_mut(&reference) {
                Some(pending) => {
                    pending.done = true;
                    (
                        pending.client.clone(),
                        pending.cmd.clone(),
                        pending.write,
                        pending.max_count,
                        pending.max_result.clone(),
                    )
                }
                None => return,
            };
        if write {
            state.updates_count += 1;
        }
        let mine = ctx.sm.do_cmd(&cmd, true);
        let my_count = state.updates_count;
        let chosen = match max_result {
            Some(peer_result) if my_count <= max_count => peer_result,
            _ => mine,
        };
        if let Some(resp) = reply_for::<M>(chosen) {
            if !client.reply(reference, ctx.me.id(), resp.clone()) {
                log::debug!("Requester is gone. Dropping reply. ref={:?}", reference);
            }
            if write {
                ctx.recent.insert(reference, resp);
            }
        }
    }

    let all_in = state
        .unstable
        .get(&reference)
        .map(|pending| pending.rem_replicas == 0)
        .unwrap_or(false);
    if all_in {
        state.unstable.remove(&reference);
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

#[cfg(test)]
mod test {
    use crate::config::{ProtocolArgs, ProtocolKind, QuorumArgs};
    use crate::mailbox::{self, Envelope, Ref};
    use crate::object::Client;
    use crate::replica::{QTag, ReplicaImage, ReplicaMsg};
    use crate::protocol::ProtocolImage;
    use crate::sm::StopReason;
    use crate::test_util::{init_logging, Kvs, KvsCmd, KvsReply};
    use crate::{Error, Node};
    use std::time::Duration;

    fn retry() -> Duration {
        Duration::from_millis(100)
    }

    fn rw(r: usize, w: usize) -> ProtocolArgs {
        ProtocolArgs::Quorum(QuorumArgs { r: Some(r), w: Some(w), shuffle: false })
    }

    #[test]
    fn reads_reflect_writes_despite_one_dead_replica() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Quorum,
                &(),
                rw(2, 2),
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        assert_eq!(
            client.invoke(&conf, KvsCmd::Put("k".into(), 1), retry()),
            Ok(KvsReply::Stored),
        );

        // Kill a non-coordinating replica between the write and the read.
        mailbox::call(
            &conf.replicas()[2],
            |reply_to| ReplicaMsg::Stop { client: reply_to, reason: StopReason::Other("testing".into()) },
            retry(),
        )
        .map(|_: crate::Response<Kvs>| ())
        .unwrap();

        assert_eq!(
            client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
            Ok(KvsReply::Value(Some(1))),
        );
    }

    #[test]
    fn a_forked_replica_joins_subsequent_quorums() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Quorum,
                &(),
                ProtocolArgs::Quorum(QuorumArgs::default()),
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        client.invoke(&conf, KvsCmd::Put("k".into(), 1), retry()).unwrap();

        let fork = client.fork_replica(&conf, 1, &Node::new("x"), retry()).unwrap();

        // The fork carried the source's state at the moment of forking.
        let image: ReplicaImage =
            serde_json::from_slice(&client.export_replica(&fork, retry()).unwrap()).unwrap();
        let copied: std::collections::BTreeMap<String, i64> =
            serde_json::from_slice(&image.sm).unwrap();
        assert_eq!(copied.get("k"), Some(&1));

        let mut replicas = vec![fork];
        replicas.extend(conf.replicas().iter().cloned());
        let conf = client.reconfigure(&conf, replicas, retry()).unwrap();

        assert_eq!(
            client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
            Ok(KvsReply::Value(Some(1))),
        );
        assert_eq!(
            client.invoke(&conf, KvsCmd::Put("k".into(), 2), retry()),
            Ok(KvsReply::Stored),
        );
        assert_eq!(
            client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
            Ok(KvsReply::Value(Some(2))),
        );
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }

    #[test]
    fn a_quorum_of_one_degenerates_to_a_singleton() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Quorum,
                &(),
                ProtocolArgs::Quorum(QuorumArgs::default()),
                &[Node::new("a")],
                retry(),
            )
            .unwrap();
        assert_eq!(
            client.invoke(&conf, KvsCmd::Put("k".into(), 5), retry()),
            Ok(KvsReply::Stored),
        );
        assert_eq!(
            client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
            Ok(KvsReply::Value(Some(5))),
        );
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }

    #[test]
    fn non_overlapping_quorums_never_spawn() {
        init_logging();
        let client = Client::<Kvs>::new();
        let verdict = client.spawn_object(
            ProtocolKind::Quorum,
            &(),
            rw(1, 1),
            &Node::vec_from(["a", "b", "c"]),
            retry(),
        );
        assert_eq!(verdict.err(), Some(Error::BadQuorum { r: 1, w: 1, n: 3 }));
    }

    #[test]
    fn shuffled_coordination_still_linearizes() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Quorum,
                &(),
                ProtocolArgs::Quorum(QuorumArgs { r: None, w: None, shuffle: true }),
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        for i in 0..10 {
            client.invoke(&conf, KvsCmd::Put("k".into(), i), retry()).unwrap();
            assert_eq!(
                client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
                Ok(KvsReply::Value(Some(i))),
            );
        }
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }

    #[test]
    fn shuffled_coordination_rotates_but_pins_each_token() {
        init_logging();
        let replicas: Vec<_> = Node::vec_from(["a", "b", "c"])
            .iter()
            .map(|node| crate::replica::spawn::<Kvs>(node, ProtocolKind::Quorum, &()))
            .collect();
        let conf = crate::Config::new(
            ProtocolKind::Quorum,
            replicas,
            ProtocolArgs::Quorum(QuorumArgs { r: None, w: None, shuffle: true }),
        )
        .unwrap();

        // A token keeps choosing the coordinator already working on it, so a
        // retransmitted mutation cannot reach a second coordinator.
        let reference = Ref::fresh();
        let pinned = super::route(&conf, reference).id();
        for _ in 0..10 {
            assert_eq!(super::route(&conf, reference).id(), pinned);
        }

        // Successive tokens spread coordination over the replicas.
        let picks: std::collections::HashSet<_> =
            (0..64).map(|_| super::route(&conf, Ref::fresh()).id()).collect();
        assert!(picks.len() > 1);
    }

    #[test]
    fn duplicate_writes_do_not_reapply() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Quorum,
                &(),
                rw(2, 2),
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();

        // Pose as a coordinator and send the same write twice.
        let (coord, acks) = mailbox::mailbox::<ReplicaMsg<Kvs>>();
        let peer = conf.replicas()[1].clone();
        let reference = Ref::fresh();
        for _ in 0..2 {
            peer.deliver(Envelope {
                reference,
                msg: ReplicaMsg::QuorumReq {
                    coord: coord.clone(),
                    qtag: QTag::Write,
                    cmd: KvsCmd::Put("k".into(), 7),
                },
            });
        }
        for _ in 0..2 {
            let env = acks.recv_timeout(Duration::from_secs(1)).unwrap();
            match env.msg {
                ReplicaMsg::QuorumAck { count, .. } => assert_eq!(count, 1),
                other => panic!("unexpected message: {:?}", other.name()),
            }
        }

        let image: ReplicaImage =
            serde_json::from_slice(&client.export_replica(&peer, retry()).unwrap()).unwrap();
        match image.protocol {
            ProtocolImage::Quorum { updates_count } => assert_eq!(updates_count, 1),
            other => panic!("unexpected image: {:?}", other),
        }
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }
}
