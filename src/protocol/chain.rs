//! Chain replication.
//!
//! Replicas form a totally ordered chain. A mutation enters at the head, is
//! applied at each replica on the way down, and the tail answers the client.
//! Reads are served by the tail, or by any replica when the configuration
//! opts in to sloppy reads. A forwarded command carries its own reply
//! address, so it completes independently of membership changes already in
//! flight; reconfiguration merely rebuilds each replica's neighbour view.

use crate::config::Config;
use crate::mailbox::{ipn, Envelope, Id, Ref, ReplyTo};
use crate::protocol::{respond, Ctx};
use crate::replica::{ReplicaAddr, ReplicaMsg, Response};
use crate::sm::StateMachine;
use crate::Error;
use ahash::AHashSet;
use rand::Rng;

pub(crate) struct State<M: StateMachine> {
    pub index: usize,
    pub prev: Option<ReplicaAddr<M>>,
    pub next: Option<ReplicaAddr<M>>,
    /// Mutations this head has already pushed into the chain, so a
    /// retransmission is not applied twice.
    pub seen: AHashSet<Ref>,
}

impl<M: StateMachine> State<M> {
    pub fn new() -> Self {
        State { index: 0, prev: None, next: None, seen: AHashSet::new() }
    }

    pub fn forked(&self) -> Self {
        State { index: 0, prev: None, next: None, seen: self.seen.clone() }
    }

    fn is_head(&self) -> bool {
        self.prev.is_none()
    }
}

pub(crate) fn update_state<M: StateMachine>(
    state: &mut State<M>,
    me: &ReplicaAddr<M>,
    conf: &Config<M>,
) {
    match ipn(me.id(), conf.replicas()) {
        Some((index, prev, next)) => {
            state.index = index;
            state.prev = prev.cloned();
            state.next = next.cloned();
            log::debug!(
                "Chain position. id={}, index={}, prev={:?}, next={:?}",
                me.id(),
                state.index,
                state.prev.as_ref().map(|addr| addr.id()),
                state.next.as_ref().map(|addr| addr.id()),
            );
        }
        None => {
            // Not a link anymore; the kernel stops this replica.
            state.index = 0;
            state.prev = None;
            state.next = None;
        }
    }
}

/// Mutations go to the head; reads go to the tail, or anywhere under sloppy
/// reads.
pub(crate) fn route<M: StateMachine>(conf: &Config<M>, cmd: &M::Command) -> ReplicaAddr<M> {
    let replicas = conf.replicas();
    if M::is_mutating(cmd) {
        return replicas[0].clone();
    }
    if conf.chain_sloppy() {
        replicas[rand::thread_rng().gen_range(0..replicas.len())].clone()
    } else {
        replicas[replicas.len() - 1].clone()
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
        ReplicaMsg::Forward { client, cmd } => {
            apply_and_pass(state, ctx, env.reference, client, cmd);
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
    if !state.is_head() {
        log::debug!(
            "Mutating command below the head. Rejecting. id={}, cmd={:?}",
            ctx.me.id(),
            cmd
        );
        client.reply(reference, ctx.me.id(), Response::Cmd(Err(Error::NotInConfiguration)));
        return;
    }
    if !state.seen.insert(reference) {
        log::debug!("Mutation already in the chain. id={}, ref={:?}", ctx.me.id(), reference);
        return;
    }
    apply_and_pass(state, ctx, reference, client, cmd);
}

/// Applies the command locally, then either forwards it down the chain under
/// the same reference or, at the tail, answers the client.
fn apply_and_pass<M: StateMachine>(
    state: &mut State<M>,
    ctx: Ctx<'_, M>,
    reference: Ref,
    client: ReplyTo<Response<M>>,
    cmd: M::Command,
) {
    match &state.next {
        Some(next) => {
            ctx.sm.do_cmd(&cmd, true);
            if !next.deliver(Envelope { reference, msg: ReplicaMsg::Forward { client, cmd } }) {
                log::debug!(
                    "Successor is gone. Command stalls until reconfiguration. id={}, ref={:?}",
                    ctx.me.id(),
                    reference
                );
            }
        }
        None => {
            if let Some(resp) =
                respond(ctx.sm, ctx.me.id(), reference, &client, &cmd, true)
            {
                ctx.recent.insert(reference, resp);
            }
        }
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
    use crate::config::{ChainArgs, ProtocolArgs, ProtocolKind};
    use crate::object::Client;
    use crate::sm::StopReason;
    use crate::test_util::{init_logging, Kvs, KvsCmd, KvsReply};
    use crate::Node;
    use std::time::Duration;

    fn retry() -> Duration {
        Duration::from_millis(100)
    }

    #[test]
    fn commands_run_down_the_chain_and_return_from_the_tail() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Chain,
                &(),
                ProtocolArgs::None,
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        assert_eq!(
            client.invoke(&conf, KvsCmd::Put("k".into(), 1), retry()),
            Ok(KvsReply::Stored),
        );
        assert_eq!(
            client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
            Ok(KvsReply::Value(Some(1))),
        );
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }

    #[test]
    fn sloppy_reads_are_served_anywhere() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Chain,
                &(),
                ProtocolArgs::Chain(ChainArgs { sloppy: true }),
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        client.invoke(&conf, KvsCmd::Put("k".into(), 3), retry()).unwrap();
        for _ in 0..10 {
            assert_eq!(
                client.invoke(&conf, KvsCmd::Get("k".into()), retry()),
                Ok(KvsReply::Value(Some(3))),
            );
        }
        client.shutdown(&conf, StopReason::Shutdown, retry()).unwrap();
    }

    #[test]
    fn a_shortened_chain_keeps_serving_after_losing_its_middle() {
        init_logging();
        let client = Client::<Kvs>::new();
        let conf = client
            .spawn_object(
                ProtocolKind::Chain,
                &(),
                ProtocolArgs::None,
                &Node::vec_from(["a", "b", "c"]),
                retry(),
            )
            .unwrap();
        client.invoke(&conf, KvsCmd::Put("k".into(), 1), retry()).unwrap();

        // Kill the middle link outright, then reconfigure it away.
        let middle = conf.replicas()[1].clone();
        crate::mailbox::call(
            &middle,
            |reply_to| crate::ReplicaMsg::Stop { client: reply_to, reason: StopReason::Other("testing".into()) },
            retry(),
        )
        .map(|_: crate::Response<Kvs>| ())
        .unwrap();

        let two = vec![conf.replicas()[0].clone(), conf.replicas()[2].clone()];
        let conf = client.reconfigure(&conf, two, retry()).unwrap();
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
}
