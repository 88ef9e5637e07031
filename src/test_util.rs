//! Example state machines backing the test suite.

use crate::sm::{CmdOutcome, StateMachine};
use std::collections::BTreeMap;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Echoes every command back and remembers having seen it, so tests can count
/// the mutations each replica observed.
pub struct Echo;

impl StateMachine for Echo {
    type Args = ();
    type Command = String;
    type Reply = String;
    type State = Vec<String>;

    fn init(_args: &()) -> Self::State {
        Vec::new()
    }

    fn handle_cmd(state: &mut Self::State, cmd: &Self::Command, _side_effects: bool) -> CmdOutcome<Self::Reply> {
        state.push(cmd.clone());
        CmdOutcome::Reply(cmd.clone())
    }

    fn is_mutating(_cmd: &Self::Command) -> bool {
        true
    }
}

/// A small key-value store with distinguishable reads and writes.
pub struct Kvs;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KvsCmd {
    Put(String, i64),
    Get(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KvsReply {
    Stored,
    Value(Option<i64>),
}

impl StateMachine for Kvs {
    type Args = ();
    type Command = KvsCmd;
    type Reply = KvsReply;
    type State = BTreeMap<String, i64>;

    fn init(_args: &()) -> Self::State {
        BTreeMap::new()
    }

    fn handle_cmd(state: &mut Self::State, cmd: &Self::Command, _side_effects: bool) -> CmdOutcome<Self::Reply> {
        match cmd {
            KvsCmd::Put(key, value) => {
                state.insert(key.clone(), *value);
                CmdOutcome::Reply(KvsReply::Stored)
            }
            KvsCmd::Get(key) => CmdOutcome::Reply(KvsReply::Value(state.get(key).copied())),
        }
    }

    fn is_mutating(cmd: &Self::Command) -> bool {
        matches!(cmd, KvsCmd::Put(..))
    }
}
