//! The state-machine abstraction being replicated.
//!
//! A [`StateMachine`] supplies deterministic command handling over an owned
//! state plus a byte-level export/import pair; the library replicates it
//! without knowing anything else about it. [`Sm`] wraps one instance for a
//! replica. The wrapper is not a separate task: the replica kernel's
//! single-threaded event loop already serializes command execution, so the
//! wrapper surface survives as plain methods.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Why a state machine is being torn down.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StopReason {
    /// An explicit stop request.
    Shutdown,
    /// The replica was dropped from its configuration.
    Reconfiguration,
    /// An operator-supplied reason.
    Other(String),
}

/// What handling one command produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CmdOutcome<R> {
    /// Answer the requester with this value.
    Reply(R),
    /// The command was applied but warrants no answer.
    NoReply,
    /// The state machine does not recognize the command.
    Unknown,
}

/// User-supplied deterministic logic to be replicated.
///
/// `handle_cmd` must be deterministic given `(state, cmd)`, and `is_mutating`
/// must be a pure function of the command; every replication protocol leans
/// on both. When `side_effects` is false the machine must compute as usual
/// but suppress externally visible effects (shadow execution during quorum
/// reads).
pub trait StateMachine: Sized + Send + 'static {
    /// Initialization arguments.
    type Args: Clone + Send + 'static;
    /// The commands clients issue.
    type Command: Clone + Debug + Send + 'static;
    /// What commands answer with.
    type Reply: Clone + Debug + Send + 'static;
    /// The replicated state itself.
    type State: Debug + Send + Serialize + DeserializeOwned + 'static;

    fn init(args: &Self::Args) -> Self::State;

    fn handle_cmd(
        state: &mut Self::State,
        cmd: &Self::Command,
        side_effects: bool,
    ) -> CmdOutcome<Self::Reply>;

    fn is_mutating(cmd: &Self::Command) -> bool;

    /// Serializes the state for shipping to another replica.
    fn export(state: &Self::State) -> Vec<u8> {
        serde_json::to_vec(state).expect("state machine state must serialize")
    }

    /// Serializes one partition of the state, identified by `tag`. Only a
    /// partitioning layer distinguishes tags; the default exports everything.
    fn export_tag(state: &Self::State, _tag: &str) -> Vec<u8> {
        Self::export(state)
    }

    fn import(bytes: &[u8]) -> Self::State {
        serde_json::from_slice(bytes).expect("exported state must deserialize")
    }

    /// Last call before the machine is dropped.
    fn stop(_state: Self::State, _reason: &StopReason) {}
}

/// One state-machine instance owned by a replica.
pub struct Sm<M: StateMachine> {
    state: M::State,
}

impl<M: StateMachine> Sm<M> {
    pub fn new(args: &M::Args) -> Self {
        Sm { state: M::init(args) }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Sm { state: M::import(bytes) }
    }

    pub fn do_cmd(&mut self, cmd: &M::Command, side_effects: bool) -> CmdOutcome<M::Reply> {
        M::handle_cmd(&mut self.state, cmd, side_effects)
    }

    pub fn export(&self) -> Vec<u8> {
        M::export(&self.state)
    }

    pub fn export_tag(&self, tag: &str) -> Vec<u8> {
        M::export_tag(&self.state, tag)
    }

    pub fn import(&mut self, bytes: &[u8]) {
        self.state = M::import(bytes);
    }

    pub fn state(&self) -> &M::State {
        &self.state
    }

    pub fn set_state(&mut self, state: M::State) {
        self.state = state;
    }

    /// Copies the machine by export + import, the same path a cross-node
    /// fork takes.
    pub fn fork(&self) -> Self {
        Sm::from_bytes(&self.export())
    }

    pub fn stop(self, reason: &StopReason) {
        M::stop(self.state, reason);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{Kvs, KvsCmd, KvsReply};

    /// A machine that recognizes nothing, for exercising the unknown-command
    /// path.
    struct Mute;

    impl StateMachine for Mute {
        type Args = ();
        type Command = String;
        type Reply = String;
        type State = u64;

        fn init(_args: &()) -> u64 {
            0
        }

        fn handle_cmd(_state: &mut u64, _cmd: &String, _side_effects: bool) -> CmdOutcome<String> {
            CmdOutcome::Unknown
        }

        fn is_mutating(_cmd: &String) -> bool {
            false
        }
    }

    #[test]
    fn commands_mutate_and_reply() {
        let mut sm: Sm<Kvs> = Sm::new(&());
        assert_eq!(
            sm.do_cmd(&KvsCmd::Put("k".into(), 1), true),
            CmdOutcome::Reply(KvsReply::Stored),
        );
        assert_eq!(
            sm.do_cmd(&KvsCmd::Get("k".into()), true),
            CmdOutcome::Reply(KvsReply::Value(Some(1))),
        );
        assert_eq!(
            sm.do_cmd(&KvsCmd::Get("missing".into()), true),
            CmdOutcome::Reply(KvsReply::Value(None)),
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        let mut sm: Sm<Mute> = Sm::new(&());
        assert_eq!(sm.do_cmd(&"anything".to_owned(), true), CmdOutcome::Unknown);
    }

    #[test]
    fn export_import_round_trips() {
        let mut sm: Sm<Kvs> = Sm::new(&());
        sm.do_cmd(&KvsCmd::Put("a".into(), 1), true);
        sm.do_cmd(&KvsCmd::Put("b".into(), 2), true);

        let mut copy: Sm<Kvs> = Sm::from_bytes(&sm.export());
        assert_eq!(copy.state(), sm.state());
        assert_eq!(
            copy.do_cmd(&KvsCmd::Get("b".into()), true),
            CmdOutcome::Reply(KvsReply::Value(Some(2))),
        );
    }

    #[test]
    fn fork_copies_the_current_state() {
        let mut sm: Sm<Kvs> = Sm::new(&());
        sm.do_cmd(&KvsCmd::Put("a".into(), 1), true);
        let fork = sm.fork();
        sm.do_cmd(&KvsCmd::Put("a".into(), 2), true);
        assert_eq!(fork.state().get("a"), Some(&1));
        assert_eq!(sm.state().get("a"), Some(&2));
    }
}
