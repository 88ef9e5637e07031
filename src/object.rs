//! The client-facing operations on a replicated object.
//!
//! A [`Client`] stands in for the calling process: it owns the inbox replies
//! come back to. Commands are routed by the configuration's protocol and
//! retransmitted on the caller's interval until answered; the recipient side
//! deduplicates by [`Ref`], so retransmission has at-most-once effect.

use crate::config::{self, Config, ProtocolArgs, ProtocolKind};
use crate::mailbox::{self, Envelope, Inbox, Ref};
use crate::node::Node;
use crate::protocol;
use crate::replica::{self, ReplicaAddr, ReplicaMsg, Response};
use crate::sm::{StateMachine, StopReason};
use crate::Error;
use std::time::Duration;

/// A handle from which one thread drives replicated objects of machine `M`.
pub struct Client<M: StateMachine> {
    inbox: Inbox<Response<M>>,
}

impl<M: StateMachine> Client<M> {
    pub fn new() -> Self {
        Client { inbox: Inbox::new() }
    }

    /// Spawns one replica per node and binds them into the version-1
    /// configuration of a new replicated object.
    pub fn spawn_object(
        &self,
        protocol: ProtocolKind,
        sm_args: &M::Args,
        args: ProtocolArgs,
        nodes: &[Node],
        retry: Duration,
    ) -> Result<Config<M>, Error> {
        config::validate(protocol, nodes.len(), &args)?;
        let replicas: Vec<_> = nodes
            .iter()
            .map(|node| replica::spawn::<M>(node, protocol, sm_args))
            .collect();
        let conf = Config::new(protocol, replicas, args)?;
        install(&conf, conf.replicas(), retry)?;
        log::info!(
            "Object spawned. protocol={:?}, replicas={}, version={}",
            protocol,
            conf.replicas().len(),
            conf.version()
        );
        Ok(conf)
    }

    /// Runs `cmd` against the object and waits for its reply, retransmitting
    /// every `retry`.
    pub fn invoke(&self, conf: &Config<M>, cmd: M::Command, retry: Duration) -> Result<M::Reply, Error> {
        let reference = Ref::fresh();
        let mut dead_routes = 0;
        let result = loop {
            // Re-route every attempt. Randomized read sources may pick a
            // different replica next time; quorum routing is a pure function
            // of the token, so a mutation keeps its coordinator.
            let dst = protocol::route(conf, reference, &cmd)?;
            let delivered = dst.deliver(Envelope {
                reference,
                msg: ReplicaMsg::Cmd {
                    client: self.inbox.reply_to(),
                    version: conf.version(),
                    cmd: cmd.clone(),
                },
            });
            if !delivered {
                dead_routes += 1;
                if dead_routes > conf.replicas().len() {
                    break Err(Error::ReplicaStopped);
                }
                continue;
            }
            match self.inbox.collect(reference, retry) {
                Ok(Response::Cmd(result)) => break result,
                Ok(other) => {
                    log::debug!("Unexpected response kind. Ignoring. got={:?}", other);
                }
                Err(Error::Timeout) => {}
                Err(e) => break Err(e),
            }
        };
        self.inbox.forget(reference);
        result
    }

    /// The asynchronous form of [`Client::invoke`]: fire the command and
    /// return its [`Ref`] for a later [`Client::collect`].
    pub fn cast(&self, conf: &Config<M>, cmd: M::Command) -> Result<Ref, Error> {
        let reference = Ref::fresh();
        let dst = protocol::route(conf, reference, &cmd)?;
        dst.deliver(Envelope {
            reference,
            msg: ReplicaMsg::Cmd {
                client: self.inbox.reply_to(),
                version: conf.version(),
                cmd,
            },
        });
        Ok(reference)
    }

    /// Waits for the reply to an earlier [`Client::cast`].
    pub fn collect(&self, reference: Ref, timeout: Duration) -> Result<M::Reply, Error> {
        match self.inbox.collect(reference, timeout)? {
            Response::Cmd(result) => result,
            other => {
                log::debug!("Unexpected response kind. got={:?}", other);
                Err(Error::Timeout)
            }
        }
    }

    /// Replaces the object's replica set, producing the successor
    /// configuration.
    ///
    /// Two stages: every member of the new set must acknowledge the new
    /// configuration; members of only the old set are then told best-effort
    /// and stop themselves, so a dead outgoing replica cannot block the
    /// change.
    pub fn reconfigure(
        &self,
        conf: &Config<M>,
        replicas: Vec<ReplicaAddr<M>>,
        retry: Duration,
    ) -> Result<Config<M>, Error> {
        let next = conf.successor(replicas)?;
        install(&next, next.replicas(), retry)?;
        for old in conf.replicas() {
            if !next.contains(old.id()) {
                let scratch = Inbox::new();
                old.deliver(Envelope {
                    reference: Ref::fresh(),
                    msg: ReplicaMsg::Reconfigure { client: scratch.reply_to(), conf: next.clone() },
                });
            }
        }
        log::info!(
            "Object reconfigured. version={}, replicas={}",
            next.version(),
            next.replicas().len()
        );
        Ok(next)
    }

    /// Removes the replica at `index` from the configuration, then stops it
    /// with `reason`.
    pub fn stop_replica(
        &self,
        conf: &Config<M>,
        index: usize,
        reason: StopReason,
        retry: Duration,
    ) -> Result<Config<M>, Error> {
        let target = conf.replicas().get(index).cloned().ok_or(Error::NotInConfiguration)?;
        let rest: Vec<_> = conf
            .replicas()
            .iter()
            .filter(|addr| addr.id() != target.id())
            .cloned()
            .collect();
        let next = conf.successor(rest)?;
        install(&next, next.replicas(), retry)?;
        mailbox::call(
            &target,
            |client| ReplicaMsg::Stop { client, reason: reason.clone() },
            retry,
        )
        .map(|_: Response<M>| ())?;
        Ok(next)
    }

    /// Materializes a copy of the replica at `index` on `node`. The copy
    /// holds the source's machine state and pending-command table but no
    /// configuration; it serves only after a subsequent
    /// [`Client::reconfigure`] includes it.
    pub fn fork_replica(
        &self,
        conf: &Config<M>,
        index: usize,
        node: &Node,
        retry: Duration,
    ) -> Result<ReplicaAddr<M>, Error> {
        let source = conf.replicas().get(index).cloned().ok_or(Error::NotInConfiguration)?;
        match mailbox::call(
            &source,
            |client| ReplicaMsg::Fork { client, node: node.clone() },
            retry,
        )? {
            Response::Forked(addr) => Ok(addr),
            other => {
                log::debug!("Unexpected response kind. got={:?}", other);
                Err(Error::Timeout)
            }
        }
    }

    /// Asks a replica which configuration it holds.
    pub fn get_conf(&self, addr: &ReplicaAddr<M>, retry: Duration) -> Result<Config<M>, Error> {
        match mailbox::call(addr, |client| ReplicaMsg::GetConf { client }, retry)? {
            Response::Conf(conf) => Ok(conf),
            Response::Cmd(Err(e)) => Err(e),
            other => {
                log::debug!("Unexpected response kind. got={:?}", other);
                Err(Error::Timeout)
            }
        }
    }

    /// Serializes a whole replica: machine state plus the protocol's durable
    /// counters.
    pub fn export_replica(&self, addr: &ReplicaAddr<M>, retry: Duration) -> Result<Vec<u8>, Error> {
        match mailbox::call(addr, |client| ReplicaMsg::Export { client }, retry)? {
            Response::Exported(bytes) => Ok(bytes),
            other => {
                log::debug!("Unexpected response kind. got={:?}", other);
                Err(Error::Timeout)
            }
        }
    }

    /// Overwrites a replica with a previously exported image.
    pub fn import_replica(
        &self,
        addr: &ReplicaAddr<M>,
        bytes: Vec<u8>,
        retry: Duration,
    ) -> Result<(), Error> {
        mailbox::call(addr, move |client| ReplicaMsg::Import { client, bytes: bytes.clone() }, retry)
            .map(|_: Response<M>| ())
    }

    /// Stops every replica in the configuration. The object is gone
    /// afterwards.
    pub fn shutdown(&self, conf: &Config<M>, reason: StopReason, retry: Duration) -> Result<(), Error> {
        mailbox::multicall(
            conf.replicas(),
            |client| ReplicaMsg::Stop { client, reason: reason.clone() },
            conf.replicas().len(),
            retry,
        )
        .map(|_| ())
    }
}

impl<M: StateMachine> Default for Client<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage one of a configuration change: every target must acknowledge.
fn install<M: StateMachine>(
    conf: &Config<M>,
    targets: &[ReplicaAddr<M>],
    retry: Duration,
) -> Result<(), Error> {
    mailbox::multicall(
        targets,
        |client| ReplicaMsg::Reconfigure { client, conf: conf.clone() },
        targets.len(),
        retry,
    )
    .map(|_| ())
}
