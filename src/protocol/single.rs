//! The trivial one-replica protocol: every command is executed locally and
//! answered immediately. It exists to pin down the callback shape the other
//! protocols follow.

use crate::config::Config;
use crate::mailbox::{Envelope, Id};
use crate::protocol::{respond, Ctx, ProtocolState};
use crate::replica::{ReplicaAddr, ReplicaMsg};
use crate::sm::StateMachine;

pub(crate) fn handle_msg<M: StateMachine>(
    ctx: Ctx<'_, M>,
    env: Envelope<ReplicaMsg<M>>,
) -> Option<Envelope<ReplicaMsg<M>>> {
    match env.msg {
        ReplicaMsg::Cmd { client, cmd, .. } => {
            let mutating = M::is_mutating(&cmd);
            if let Some(resp) = respond(ctx.sm, ctx.me.id(), env.reference, &client, &cmd, true) {
                if mutating {
                    ctx.recent.insert(env.reference, resp);
                }
            }
            None
        }
        msg => Some(Envelope { reference: env.reference, msg }),
    }
}

pub(crate) fn handle_failure<M: StateMachine>(
    me: &ReplicaAddr<M>,
    conf: Config<M>,
    state: ProtocolState<M>,
    failed: Id,
    info: &str,
) -> (Config<M>, ProtocolState<M>) {
    log::info!("Masking peer failure. id={}, failed={}, info={}", me.id(), failed, info);
    (conf, state)
}

#[cfg(test)]
mod test {
    use crate::config::{ProtocolArgs, ProtocolKind};
    use crate::object::Client;
    use crate::sm::StopReason;
    use crate::test_util::{init_logging, Echo};
    use crate::Node;
    use std::time::Duration;

    #[test]
    fn a_singleton_object_echoes() {
        init_logging();
        let retry = Duration::from_millis(100);
        let client = Client::<Echo>::new();
        let conf = client
            .spawn_object(ProtocolKind::Single, &(), ProtocolArgs::None, &[Node::new("a")], retry)
            .unwrap();
        assert_eq!(client.invoke(&conf, "hi".into(), retry), Ok("hi".into()));
        assert_eq!(client.invoke(&conf, "there".into(), retry), Ok("there".into()));
        client.shutdown(&conf, StopReason::Shutdown, retry).unwrap();
    }
}
