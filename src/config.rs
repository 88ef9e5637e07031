//! The immutable configuration value that names a replicated object's
//! protocol, replica set, and options.
//!
//! Configurations are never mutated in place: reconfiguration produces a
//! successor whose `version` is one higher, and every message a client issues
//! carries the version of the configuration it was routed with.

use crate::mailbox::Id;
use crate::replica::ReplicaAddr;
use crate::sm::StateMachine;
use crate::{majority, Error};
use std::fmt::{Debug, Formatter};

/// Identifies a replication protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProtocolKind {
    Single,
    PrimaryBackup,
    Chain,
    Quorum,
}

/// Which replica serves non-mutating primary/backup commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadSource {
    /// The primary serves every read.
    Primary,
    /// A random backup serves reads, falling back to the primary when there
    /// is none.
    Backup,
    /// Any replica serves reads.
    Random,
}

impl Default for ReadSource {
    fn default() -> Self {
        ReadSource::Primary
    }
}

/// Options recognized by the primary/backup protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrimaryBackupArgs {
    pub read_src: ReadSource,
}

/// Options recognized by the chain protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainArgs {
    /// Serve reads from any replica instead of only the tail.
    pub sloppy: bool,
}

/// Options recognized by the quorum protocol.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QuorumArgs {
    /// Read quorum size. Defaults to a majority.
    pub r: Option<usize>,
    /// Write quorum size. Defaults to a majority.
    pub w: Option<usize>,
    /// Rotate coordination round-robin over the replicas instead of always
    /// using the first.
    pub shuffle: bool,
}

/// Protocol-specific configuration options.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolArgs {
    None,
    PrimaryBackup(PrimaryBackupArgs),
    Chain(ChainArgs),
    Quorum(QuorumArgs),
}

impl Default for ProtocolArgs {
    fn default() -> Self {
        ProtocolArgs::None
    }
}

/// Immutable descriptor of a replicated object: protocol, replicas, version,
/// and options. Replica order is protocol-significant for primary/backup
/// (head is the primary) and chain (head to tail).
pub struct Config<M: StateMachine> {
    protocol: ProtocolKind,
    replicas: Vec<ReplicaAddr<M>>,
    version: u64,
    args: ProtocolArgs,
    shard_agent: Option<Id>,
}

impl<M: StateMachine> PartialEq for Config<M> {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.replicas == other.replicas
            && self.version == other.version
            && self.args == other.args
            && self.shard_agent == other.shard_agent
    }
}

impl<M: StateMachine> Config<M> {
    /// Builds the version-1 configuration for a fresh object.
    pub fn new(
        protocol: ProtocolKind,
        replicas: Vec<ReplicaAddr<M>>,
        args: ProtocolArgs,
    ) -> Result<Self, Error> {
        validate(protocol, replicas.len(), &args)?;
        Ok(Config { protocol, replicas, version: 1, args, shard_agent: None })
    }

    /// Builds the next configuration in this lineage with a replacement
    /// replica set.
    pub fn successor(&self, replicas: Vec<ReplicaAddr<M>>) -> Result<Self, Error> {
        validate(self.protocol, replicas.len(), &self.args)?;
        Ok(Config {
            protocol: self.protocol,
            replicas,
            version: self.version + 1,
            args: self.args,
            shard_agent: self.shard_agent,
        })
    }

    /// Records the partitioning layer's agent. Only meaningful when this
    /// configuration is managed by one.
    pub fn with_shard_agent(mut self, agent: Id) -> Self {
        self.shard_agent = Some(agent);
        self
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn replicas(&self) -> &[ReplicaAddr<M>] {
        &self.replicas
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn args(&self) -> ProtocolArgs {
        self.args
    }

    pub fn shard_agent(&self) -> Option<Id> {
        self.shard_agent
    }

    pub fn contains(&self, id: Id) -> bool {
        self.replicas.iter().any(|addr| addr.id() == id)
    }

    pub fn index_of(&self, id: Id) -> Option<usize> {
        self.replicas.iter().position(|addr| addr.id() == id)
    }

    /// The primary/backup read source, defaulted when unspecified.
    pub fn read_src(&self) -> ReadSource {
        match self.args {
            ProtocolArgs::PrimaryBackup(args) => args.read_src,
            _ => ReadSource::default(),
        }
    }

    /// Whether chain reads may be served off the tail.
    pub fn chain_sloppy(&self) -> bool {
        match self.args {
            ProtocolArgs::Chain(args) => args.sloppy,
            _ => false,
        }
    }

    /// The effective `(r, w)` quorum sizes, defaulted to majorities.
    pub fn quorum_sizes(&self) -> (usize, usize) {
        let fallback = majority(self.replicas.len());
        match self.args {
            ProtocolArgs::Quorum(args) => {
                (args.r.unwrap_or(fallback), args.w.unwrap_or(fallback))
            }
            _ => (fallback, fallback),
        }
    }

    /// Whether quorum coordination rotates across the replicas.
    pub fn shuffle(&self) -> bool {
        match self.args {
            ProtocolArgs::Quorum(args) => args.shuffle,
            _ => false,
        }
    }
}

/// Rejects replica sets and options no protocol instance could serve.
pub(crate) fn validate(protocol: ProtocolKind, n: usize, args: &ProtocolArgs) -> Result<(), Error> {
    if n == 0 {
        return Err(Error::NoReplicas);
    }
    if protocol == ProtocolKind::Quorum {
        let fallback = majority(n);
        let (r, w) = match args {
            ProtocolArgs::Quorum(args) => {
                (args.r.unwrap_or(fallback), args.w.unwrap_or(fallback))
            }
            _ => (fallback, fallback),
        };
        if r == 0 || w == 0 || r > n || w > n || r + w <= n {
            return Err(Error::BadQuorum { r, w, n });
        }
    }
    Ok(())
}

impl<M: StateMachine> Clone for Config<M> {
    fn clone(&self) -> Self {
        Config {
            protocol: self.protocol,
            replicas: self.replicas.clone(),
            version: self.version,
            args: self.args,
            shard_agent: self.shard_agent,
        }
    }
}

impl<M: StateMachine> Debug for Config<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("replicas", &self.replicas)
            .field("args", &self.args)
            .field("shard_agent", &self.shard_agent)
            .finish()
    }
}
