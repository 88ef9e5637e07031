//! The generic replica process.
//!
//! Every protocol runs on the same kernel: a thread that owns one state
//! machine, the current configuration, and the protocol's private state, and
//! dispatches each inbound message to the protocol first. Whatever the
//! protocol does not consume falls through to the built-in handlers
//! (reconfigure, get_conf, stop, export, import, fork, peer_down).
//!
//! A replica starts neutral: it holds no configuration and parks client work
//! until its first `Reconfigure` arrives. It runs until stopped explicitly or
//! dropped from a configuration that does not include it.

use crate::config::{Config, ProtocolKind};
use crate::mailbox::{self, Envelope, Id, Ref, ReplyTo};
use crate::node::Node;
use crate::protocol::{Ctx, ProtocolImage, ProtocolState};
use crate::sm::{CmdOutcome, Sm, StateMachine, StopReason};
use crate::Error;
use ahash::AHashMap;
use std::sync::mpsc::Receiver;
use std::thread;

/// The address of a replica's mailbox.
pub type ReplicaAddr<M> = mailbox::Address<ReplicaMsg<M>>;

/// Distinguishes quorum read traffic from quorum write traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QTag {
    Read,
    Write,
}

/// Everything that can arrive in a replica's mailbox.
pub enum ReplicaMsg<M: StateMachine> {
    /// A client command, stamped with the version of the configuration it
    /// was routed under.
    Cmd { client: ReplyTo<Response<M>>, version: u64, cmd: M::Command },

    /// Primary/backup: the primary replicating command `num` to a backup.
    Replicate { primary: ReplicaAddr<M>, num: u64, cmd: M::Command },
    /// Primary/backup: a backup acknowledging command `num`.
    Stabilized { num: u64 },

    /// Chain: a command flowing from a predecessor toward the tail.
    Forward { client: ReplyTo<Response<M>>, cmd: M::Command },

    /// Quorum: a coordinator asking a peer to execute.
    QuorumReq { coord: ReplicaAddr<M>, qtag: QTag, cmd: M::Command },
    /// Quorum: a peer's answer, carrying its update count for
    /// reconciliation.
    QuorumAck { from: Id, count: u64, result: CmdOutcome<M::Reply> },

    /// Install a configuration with a strictly higher version.
    Reconfigure { client: ReplyTo<Response<M>>, conf: Config<M> },
    GetConf { client: ReplyTo<Response<M>> },
    Export { client: ReplyTo<Response<M>> },
    Import { client: ReplyTo<Response<M>>, bytes: Vec<u8> },
    /// Materialize a copy of this replica on `node`.
    Fork { client: ReplyTo<Response<M>>, node: Node },
    Stop { client: ReplyTo<Response<M>>, reason: StopReason },

    /// A monitor's report that a peer died. Routed to the protocol's
    /// failure handler.
    PeerDown { id: Id, info: String },
}

impl<M: StateMachine> ReplicaMsg<M> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ReplicaMsg::Cmd { .. } => "cmd",
            ReplicaMsg::Replicate { .. } => "replicate",
            ReplicaMsg::Stabilized { .. } => "stabilized",
            ReplicaMsg::Forward { .. } => "forward",
            ReplicaMsg::QuorumReq { .. } => "quorum_req",
            ReplicaMsg::QuorumAck { .. } => "quorum_ack",
            ReplicaMsg::Reconfigure { .. } => "reconfigure",
            ReplicaMsg::GetConf { .. } => "get_conf",
            ReplicaMsg::Export { .. } => "export",
            ReplicaMsg::Import { .. } => "import",
            ReplicaMsg::Fork { .. } => "fork",
            ReplicaMsg::Stop { .. } => "stop",
            ReplicaMsg::PeerDown { .. } => "peer_down",
        }
    }
}

impl<M: StateMachine> Clone for ReplicaMsg<M> {
    fn clone(&self) -> Self {
        match self {
            ReplicaMsg::Cmd { client, version, cmd } => ReplicaMsg::Cmd {
                client: client.clone(),
                version: *version,
                cmd: cmd.clone(),
            },
            ReplicaMsg::Replicate { primary, num, cmd } => ReplicaMsg::Replicate {
                primary: primary.clone(),
                num: *num,
                cmd: cmd.clone(),
            },
            ReplicaMsg::Stabilized { num } => ReplicaMsg::Stabilized { num: *num },
            ReplicaMsg::Forward { client, cmd } => ReplicaMsg::Forward {
                client: client.clone(),
                cmd: cmd.clone(),
            },
            ReplicaMsg::QuorumReq { coord, qtag, cmd } => ReplicaMsg::QuorumReq {
                coord: coord.clone(),
                qtag: *qtag,
                cmd: cmd.clone(),
            },
            ReplicaMsg::QuorumAck { from, count, result } => ReplicaMsg::QuorumAck {
                from: *from,
                count: *count,
                result: result.clone(),
            },
            ReplicaMsg::Reconfigure { client, conf } => ReplicaMsg::Reconfigure {
                client: client.clone(),
                conf: conf.clone(),
            },
            ReplicaMsg::GetConf { client } => ReplicaMsg::GetConf { client: client.clone() },
            ReplicaMsg::Export { client } => ReplicaMsg::Export { client: client.clone() },
            ReplicaMsg::Import { client, bytes } => ReplicaMsg::Import {
                client: client.clone(),
                bytes: bytes.clone(),
            },
            ReplicaMsg::Fork { client, node } => ReplicaMsg::Fork {
                client: client.clone(),
                node: node.clone(),
            },
            ReplicaMsg::Stop { client, reason } => ReplicaMsg::Stop {
                client: client.clone(),
                reason: reason.clone(),
            },
            ReplicaMsg::PeerDown { id, info } => ReplicaMsg::PeerDown {
                id: *id,
                info: info.clone(),
            },
        }
    }
}

/// Everything a replica can answer a client with.
pub enum Response<M: StateMachine> {
    /// The outcome of a command.
    Cmd(Result<M::Reply, Error>),
    Conf(Config<M>),
    Exported(Vec<u8>),
    Forked(ReplicaAddr<M>),
    /// A bare acknowledgement.
    Done,
}

impl<M: StateMachine> Clone for Response<M> {
    fn clone(&self) -> Self {
        match self {
            Response::Cmd(result) => Response::Cmd(result.clone()),
            Response::Conf(conf) => Response::Conf(conf.clone()),
            Response::Exported(bytes) => Response::Exported(bytes.clone()),
            Response::Forked(addr) => Response::Forked(addr.clone()),
            Response::Done => Response::Done,
        }
    }
}

impl<M: StateMachine> PartialEq for Response<M>
where
    M::Reply: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Response::Cmd(a), Response::Cmd(b)) => a == b,
            (Response::Conf(a), Response::Conf(b)) => a == b,
            (Response::Exported(a), Response::Exported(b)) => a == b,
            (Response::Forked(a), Response::Forked(b)) => a == b,
            (Response::Done, Response::Done) => true,
            _ => false,
        }
    }
}

impl<M: StateMachine> std::fmt::Debug for Response<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Cmd(result) => f.debug_tuple("Cmd").field(result).finish(),
            Response::Conf(conf) => f.debug_tuple("Conf").field(conf).finish(),
            Response::Exported(bytes) => f.debug_tuple("Exported").field(&bytes.len()).finish(),
            Response::Forked(addr) => f.debug_tuple("Forked").field(addr).finish(),
            Response::Done => f.write_str("Done"),
        }
    }
}

/// The serialized form of a whole replica: the state machine's bytes plus the
/// protocol's durable counters. Pending operations reference live client
/// mailboxes and are deliberately left behind.
#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub(crate) struct ReplicaImage {
    pub sm: Vec<u8>,
    pub protocol: ProtocolImage,
}

/// Spawns a neutral replica on `node`. It initializes its state machine from
/// `sm_args` and waits for its first `Reconfigure` to learn its
/// configuration.
pub fn spawn<M: StateMachine>(
    node: &Node,
    protocol: ProtocolKind,
    sm_args: &M::Args,
) -> ReplicaAddr<M> {
    spawn_with(node, protocol, Sm::new(sm_args), ProtocolState::init(protocol))
}

/// Spawns a replica with pre-seeded state, the fork path.
pub(crate) fn spawn_with<M: StateMachine>(
    node: &Node,
    protocol: ProtocolKind,
    sm: Sm<M>,
    state: ProtocolState<M>,
) -> ReplicaAddr<M> {
    let (me, rx) = mailbox::mailbox();
    let replica = Replica {
        me: me.clone(),
        node: node.clone(),
        protocol,
        sm,
        conf: None,
        state,
        queued: Vec::new(),
        recent: AHashMap::new(),
    };
    thread::spawn(move || replica.run(rx));
    me
}

enum Flow {
    Continue,
    Exit(StopReason),
}

struct Replica<M: StateMachine> {
    me: ReplicaAddr<M>,
    node: Node,
    protocol: ProtocolKind,
    sm: Sm<M>,
    conf: Option<Config<M>>,
    state: ProtocolState<M>,
    /// Client work parked until the first configuration arrives.
    queued: Vec<Envelope<ReplicaMsg<M>>>,
    /// Answers to mutating requests, kept so a retransmitted `Ref` has
    /// at-most-once effect.
    recent: AHashMap<Ref, Response<M>>,
}

impl<M: StateMachine> Replica<M> {
    fn run(mut self, rx: Receiver<Envelope<ReplicaMsg<M>>>) {
        log::info!(
            "Replica started. id={}, node={}, protocol={:?}",
            self.me.id(),
            self.node,
            self.protocol
        );
        let reason = loop {
            let env = match rx.recv() {
                Ok(env) => env,
                // Every address clone is gone; nothing can reach us again.
                Err(_) => break StopReason::Shutdown,
            };
            match self.handle(env) {
                Flow::Continue => {}
                Flow::Exit(reason) => break reason,
            }
        };
        log::info!("Replica stopped. id={}, reason={:?}", self.me.id(), reason);
        log::debug!("Final state. id={}, state={:?}", self.me.id(), self.sm.state());
        self.sm.stop(&reason);
    }

    fn handle(&mut self, env: Envelope<ReplicaMsg<M>>) -> Flow {
        if self.conf.is_none() {
            return self.handle_unbound(env);
        }

        if let ReplicaMsg::Cmd { client, version, .. } = &env.msg {
            let current = self.conf.as_ref().map(|c| c.version()).unwrap_or(0);
            if *version != current {
                log::debug!(
                    "Command for another configuration. id={}, current={}, got={}",
                    self.me.id(),
                    current,
                    version
                );
                client.reply(env.reference, self.me.id(), Response::Cmd(Err(Error::NotInConfiguration)));
                return Flow::Continue;
            }
            if let Some(resp) = self.recent.get(&env.reference) {
                log::debug!(
                    "Duplicate command. Replying from cache. id={}, ref={:?}",
                    self.me.id(),
                    env.reference
                );
                client.reply(env.reference, self.me.id(), resp.clone());
                return Flow::Continue;
            }
        }

        let leftover = match self.conf.as_ref() {
            Some(conf) => self.state.handle_msg(
                Ctx { me: &self.me, conf, sm: &mut self.sm, recent: &mut self.recent },
                env,
            ),
            None => Some(env),
        };
        match leftover {
            None => Flow::Continue,
            Some(env) => self.builtin(env),
        }
    }

    /// Before the first configuration: park client work, drop protocol
    /// traffic that has nowhere to go, serve the kernel operations.
    fn handle_unbound(&mut self, env: Envelope<ReplicaMsg<M>>) -> Flow {
        match env.msg {
            ReplicaMsg::Cmd { .. } | ReplicaMsg::GetConf { .. } => {
                log::debug!(
                    "Parking client work until configured. id={}, msg={}",
                    self.me.id(),
                    env.msg.name()
                );
                self.queued.push(env);
                Flow::Continue
            }
            ReplicaMsg::Replicate { .. }
            | ReplicaMsg::Stabilized { .. }
            | ReplicaMsg::Forward { .. }
            | ReplicaMsg::QuorumReq { .. }
            | ReplicaMsg::QuorumAck { .. }
            | ReplicaMsg::PeerDown { .. } => {
                log::debug!(
                    "Dropping protocol message while unconfigured. id={}, msg={}",
                    self.me.id(),
                    env.msg.name()
                );
                Flow::Continue
            }
            _ => self.builtin(env),
        }
    }

    fn builtin(&mut self, env: Envelope<ReplicaMsg<M>>) -> Flow {
        let reference = env.reference;
        match env.msg {
            ReplicaMsg::Reconfigure { client, conf } => self.reconfigure(reference, client, conf),
            ReplicaMsg::GetConf { client } => {
                match self.conf.clone() {
                    Some(conf) => client.reply(reference, self.me.id(), Response::Conf(conf)),
                    None => client.reply(
                        reference,
                        self.me.id(),
                        Response::Cmd(Err(Error::NotInConfiguration)),
                    ),
                };
                Flow::Continue
            }
            ReplicaMsg::Stop { client, reason } => {
                client.reply(reference, self.me.id(), Response::Done);
                Flow::Exit(reason)
            }
            ReplicaMsg::Export { client } => {
                let image = ReplicaImage { sm: self.sm.export(), protocol: self.state.export() };
                let bytes = serde_json::to_vec(&image).expect("replica image must serialize");
                client.reply(reference, self.me.id(), Response::Exported(bytes));
                Flow::Continue
            }
            ReplicaMsg::Import { client, bytes } => {
                match serde_json::from_slice::<ReplicaImage>(&bytes) {
                    Ok(image) => {
                        self.sm.import(&image.sm);
                        self.state = ProtocolState::import(self.protocol, image.protocol);
                        if let Some(conf) = self.conf.as_ref() {
                            self.state.update_state(&self.me, conf);
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Discarding unreadable image. id={}, err={}",
                            self.me.id(),
                            e
                        );
                    }
                }
                client.reply(reference, self.me.id(), Response::Done);
                Flow::Continue
            }
            ReplicaMsg::Fork { client, node } => {
                // A retransmitted fork must not spawn a second copy.
                if let Some(resp) = self.recent.get(&reference) {
                    client.reply(reference, self.me.id(), resp.clone());
                    return Flow::Continue;
                }
                let child = spawn_with(&node, self.protocol, self.sm.fork(), self.state.forked());
                log::info!(
                    "Forked replica. id={}, child={}, node={}",
                    self.me.id(),
                    child.id(),
                    node
                );
                let resp = Response::Forked(child);
                self.recent.insert(reference, resp.clone());
                client.reply(reference, self.me.id(), resp);
                Flow::Continue
            }
            ReplicaMsg::PeerDown { id, info } => {
                if let Some(conf) = self.conf.take() {
                    let state = std::mem::replace(&mut self.state, ProtocolState::init(self.protocol));
                    let (conf, state) =
                        ProtocolState::handle_failure(&self.me, conf, state, id, &info);
                    self.conf = Some(conf);
                    self.state = state;
                }
                Flow::Continue
            }
            other => {
                log::debug!(
                    "Unhandled message. Dropping. id={}, msg={}",
                    self.me.id(),
                    other.name()
                );
                Flow::Continue
            }
        }
    }

    fn reconfigure(
        &mut self,
        reference: Ref,
        client: ReplyTo<Response<M>>,
        new_conf: Config<M>,
    ) -> Flow {
        let current = self.conf.as_ref().map(|c| c.version()).unwrap_or(0);
        if new_conf.version() <= current {
            log::debug!(
                "Ignoring stale configuration. id={}, current={}, offered={}",
                self.me.id(),
                current,
                new_conf.version()
            );
            // Still acknowledge so retransmitted reconfigurations terminate.
            client.reply(reference, self.me.id(), Response::Done);
            return Flow::Continue;
        }
        if !new_conf.contains(self.me.id()) {
            log::info!(
                "Excluded from configuration. Stopping. id={}, version={}",
                self.me.id(),
                new_conf.version()
            );
            client.reply(reference, self.me.id(), Response::Done);
            return Flow::Exit(StopReason::Reconfiguration);
        }
        self.state.update_state(&self.me, &new_conf);
        log::info!(
            "Installed configuration. id={}, version={}, replicas={}",
            self.me.id(),
            new_conf.version(),
            new_conf.replicas().len()
        );
        self.conf = Some(new_conf);
        // Commands from older configurations can no longer match the version
        // gate, so their cached answers are dead weight.
        self.recent.clear();
        client.reply(reference, self.me.id(), Response::Done);
        for env in std::mem::take(&mut self.queued) {
            if let Flow::Exit(reason) = self.handle(env) {
                return Flow::Exit(reason);
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ProtocolArgs;
    use crate::mailbox::{call, Inbox};
    use crate::test_util::{init_logging, Kvs, KvsCmd, KvsReply};
    use std::time::Duration;

    fn retry() -> Duration {
        Duration::from_millis(50)
    }

    fn single_conf(addr: &ReplicaAddr<Kvs>) -> Config<Kvs> {
        Config::new(ProtocolKind::Single, vec![addr.clone()], ProtocolArgs::None).unwrap()
    }

    fn install(addr: &ReplicaAddr<Kvs>, conf: &Config<Kvs>) {
        let conf = conf.clone();
        call(addr, move |client| ReplicaMsg::Reconfigure { client, conf: conf.clone() }, retry())
            .map(|_: Response<Kvs>| ())
            .unwrap();
    }

    fn do_cmd(addr: &ReplicaAddr<Kvs>, version: u64, cmd: KvsCmd) -> Result<KvsReply, Error> {
        match call(addr, |client| ReplicaMsg::Cmd { client, version, cmd: cmd.clone() }, retry()) {
            Ok(Response::Cmd(result)) => result,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn client_work_is_parked_until_the_first_configuration() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);

        // Issue a command before any configuration is installed.
        let inbox = Inbox::new();
        let reference = Ref::fresh();
        addr.deliver(Envelope {
            reference,
            msg: ReplicaMsg::Cmd {
                client: inbox.reply_to(),
                version: conf.version(),
                cmd: KvsCmd::Put("k".into(), 1),
            },
        });
        assert_eq!(inbox.collect(reference, Duration::from_millis(30)), Err(Error::Timeout));

        install(&addr, &conf);
        match inbox.collect(reference, Duration::from_secs(1)) {
            Ok(Response::Cmd(Ok(KvsReply::Stored))) => {}
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(do_cmd(&addr, conf.version(), KvsCmd::Get("k".into())), Ok(KvsReply::Value(Some(1))));
    }

    #[test]
    fn commands_for_other_versions_are_rejected() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);
        install(&addr, &conf);
        assert_eq!(
            do_cmd(&addr, conf.version() + 7, KvsCmd::Get("k".into())),
            Err(Error::NotInConfiguration),
        );
    }

    #[test]
    fn stale_reconfigurations_are_acknowledged_but_ignored() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);
        install(&addr, &conf);
        // Same version again: acknowledged, no effect.
        install(&addr, &conf);
        let held = match call(&addr, |client| ReplicaMsg::GetConf { client }, retry()) {
            Ok(Response::Conf(held)) => held,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(held.version(), conf.version());
    }

    #[test]
    fn excluded_replicas_stop_after_acknowledging() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let other = spawn::<Kvs>(&Node::new("b"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);
        install(&addr, &conf);

        let next = conf.successor(vec![other.clone()]).unwrap();
        install(&other, &next);
        install(&addr, &next);

        // The excluded replica's mailbox drains and closes.
        let verdict = call(&addr, |client| ReplicaMsg::GetConf { client }, Duration::from_millis(10));
        assert_eq!(verdict.map(|_: Response<Kvs>| ()), Err(Error::ReplicaStopped));
    }

    #[test]
    fn peer_failure_reports_are_masked() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);
        install(&addr, &conf);
        addr.deliver(Envelope {
            reference: Ref::fresh(),
            msg: ReplicaMsg::PeerDown { id: addr.id(), info: "heartbeat lost".into() },
        });
        // The default failure handling masks; the replica keeps serving.
        assert_eq!(
            do_cmd(&addr, conf.version(), KvsCmd::Put("k".into(), 1)),
            Ok(KvsReply::Stored),
        );
    }

    #[test]
    fn export_import_transfers_behaviour() {
        init_logging();
        let addr = spawn::<Kvs>(&Node::new("a"), ProtocolKind::Single, &());
        let conf = single_conf(&addr);
        install(&addr, &conf);
        do_cmd(&addr, conf.version(), KvsCmd::Put("k".into(), 9)).unwrap();

        let bytes = match call(&addr, |client| ReplicaMsg::Export { client }, retry()) {
            Ok(Response::Exported(bytes)) => bytes,
            other => panic!("unexpected response: {:?}", other),
        };

        let copy = spawn::<Kvs>(&Node::new("b"), ProtocolKind::Single, &());
        let copy_conf = single_conf(&copy);
        install(&copy, &copy_conf);
        let bytes_for_import = bytes.clone();
        call(&copy, move |client| ReplicaMsg::Import { client, bytes: bytes_for_import.clone() }, retry())
            .map(|_: Response<Kvs>| ())
            .unwrap();
        assert_eq!(
            do_cmd(&copy, copy_conf.version(), KvsCmd::Get("k".into())),
            Ok(KvsReply::Value(Some(9))),
        );
    }
}
