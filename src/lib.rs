//! A library for turning a deterministic state machine into a fault-tolerant,
//! reconfigurable replicated object.
//!
//! A client interacts with the replicated object as if it were a single state
//! machine; the library distributes commands across a set of replica threads
//! using one of several interchangeable replication protocols (singleton,
//! primary/backup, chain, quorum), and allows the replica set to be changed at
//! runtime (add, remove, fork, relocate) without disrupting service.
//!
//! ## Example
//!
//! In the following example a small key-value store is replicated with the
//! primary/backup protocol across three replicas, then reconfigured down to
//! two.
//!
//! ```
//! use replicant::*;
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//!
//! #[derive(Clone, Debug, Eq, PartialEq)]
//! enum Cmd { Put(String, u64), Get(String) }
//!
//! struct Kv;
//!
//! impl StateMachine for Kv {
//!     type Args = ();
//!     type Command = Cmd;
//!     type Reply = Option<u64>;
//!     type State = BTreeMap<String, u64>;
//!
//!     fn init(_args: &Self::Args) -> Self::State {
//!         BTreeMap::new()
//!     }
//!
//!     fn handle_cmd(state: &mut Self::State, cmd: &Self::Command, _side_effects: bool)
//!         -> CmdOutcome<Self::Reply>
//!     {
//!         match cmd {
//!             Cmd::Put(k, v) => CmdOutcome::Reply(state.insert(k.clone(), *v)),
//!             Cmd::Get(k) => CmdOutcome::Reply(state.get(k).copied()),
//!         }
//!     }
//!
//!     fn is_mutating(cmd: &Self::Command) -> bool {
//!         matches!(cmd, Cmd::Put(..))
//!     }
//! }
//!
//! let retry = Duration::from_millis(100);
//! let client = Client::<Kv>::new();
//! let nodes = Node::vec_from(["a", "b", "c"]);
//! let conf = client
//!     .spawn_object(ProtocolKind::PrimaryBackup, &(), ProtocolArgs::None, &nodes, retry)
//!     .unwrap();
//! assert_eq!(client.invoke(&conf, Cmd::Put("x".into(), 1), retry), Ok(None));
//! assert_eq!(client.invoke(&conf, Cmd::Get("x".into()), retry), Ok(Some(1)));
//!
//! let smaller = conf.replicas()[..2].to_vec();
//! let conf = client.reconfigure(&conf, smaller, retry).unwrap();
//! assert_eq!(client.invoke(&conf, Cmd::Get("x".into()), retry), Ok(Some(1)));
//! client.shutdown(&conf, StopReason::Shutdown, retry).unwrap();
//! ```

use std::fmt::{Display, Formatter};

pub mod config;
pub mod mailbox;
pub mod node;
pub mod object;
mod protocol;
pub mod replica;
pub mod sm;
#[cfg(test)]
pub mod test_util;

pub use config::{ChainArgs, Config, PrimaryBackupArgs, ProtocolArgs, ProtocolKind, QuorumArgs, ReadSource};
pub use mailbox::{Id, Inbox, Ref};
pub use node::Node;
pub use object::Client;
pub use replica::{ReplicaAddr, ReplicaMsg, Response};
pub use sm::{CmdOutcome, StateMachine, StopReason};

/// The ways a replicated-object operation can fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// No matching reply arrived before the deadline.
    Timeout,
    /// The configuration names no replicas.
    NoReplicas,
    /// The requested read/write quorum sizes do not overlap.
    BadQuorum { r: usize, w: usize, n: usize },
    /// The state machine does not recognize the command.
    UnknownCommand,
    /// The replica does not hold the configuration the message was issued
    /// against.
    NotInConfiguration,
    /// The replica's mailbox is gone.
    ReplicaStopped,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Timeout => write!(f, "timed out waiting for a reply"),
            Error::NoReplicas => write!(f, "configuration names no replicas"),
            Error::BadQuorum { r, w, n } => {
                write!(f, "quorums do not overlap: r={} + w={} <= n={}", r, w, n)
            }
            Error::UnknownCommand => write!(f, "state machine does not recognize the command"),
            Error::NotInConfiguration => write!(f, "replica does not hold this configuration"),
            Error::ReplicaStopped => write!(f, "replica is stopped"),
        }
    }
}

impl std::error::Error for Error {}

/// Indicates the number of replicas that constitute a majority for a
/// particular replica-set size.
pub fn majority(replica_count: usize) -> usize {
    replica_count / 2 + 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn majority_is_computed_correctly() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn errors_render_their_cause() {
        let rendered = format!("{}", Error::BadQuorum { r: 1, w: 1, n: 3 });
        assert!(rendered.contains("r=1"));
        assert!(rendered.contains("n=3"));
    }
}
