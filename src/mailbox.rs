//! Messaging primitives shared by clients and replicas: unique request
//! tokens, mailbox addresses, and the async ([`cast`]/[`Inbox::collect`]) and
//! sync ([`call`]/[`multicall`]) request families.
//!
//! Every in-flight request is tagged with a [`Ref`]; replies carry the same
//! `Ref` plus the responder's [`Id`] so that fan-out responses stay
//! attributable. `call` retransmits on an interval and never gives up on its
//! own; the `collect` family takes an explicit timeout and returns whatever
//! arrived. Recipients must treat a duplicate `Ref` as a single logical
//! request.

use crate::Error;
use std::cell::RefCell;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// A request token. Unique for the lifetime of the process and never reused.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ref(u64);

impl Ref {
    /// Draws a fresh token.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Ref(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Projects the token onto `0..n`. Tokens come off a counter, so
    /// consecutive requests rotate through the slots while any one token
    /// keeps mapping to the same slot.
    pub(crate) fn slot(&self, n: usize) -> usize {
        (self.0 % n as u64) as usize
    }
}

impl Debug for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Ref({})", self.0))
    }
}

/// Uniquely identifies a mailbox-owning process (a replica or a client).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Id(u64);

impl Id {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Id(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Id({})", self.0))
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// What travels to a mailbox: the request token plus the payload.
pub struct Envelope<T> {
    pub reference: Ref,
    pub msg: T,
}

/// A cloneable handle on some process's mailbox.
pub struct Address<T> {
    id: Id,
    tx: Sender<Envelope<T>>,
}

impl<T> Address<T> {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Hands the envelope to the mailbox. Returns false if the owning process
    /// is gone.
    pub(crate) fn deliver(&self, env: Envelope<T>) -> bool {
        self.tx.send(env).is_ok()
    }
}

impl<T> Clone for Address<T> {
    fn clone(&self) -> Self {
        Address { id: self.id, tx: self.tx.clone() }
    }
}

impl<T> PartialEq for Address<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Address<T> {}

impl<T> std::hash::Hash for Address<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> Debug for Address<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Address({})", self.id))
    }
}

/// Creates a mailbox, returning its address and the receiving end.
pub(crate) fn mailbox<T>() -> (Address<T>, Receiver<Envelope<T>>) {
    let (tx, rx) = channel();
    (Address { id: Id::fresh(), tx }, rx)
}

/// A reply envelope: the request token, the responder, and the payload.
pub struct ReplyEnvelope<R> {
    pub reference: Ref,
    pub from: Id,
    pub reply: R,
}

/// Where a recipient sends its reply.
pub struct ReplyTo<R> {
    tx: Sender<ReplyEnvelope<R>>,
}

impl<R> ReplyTo<R> {
    /// Sends the reply. Returns false if the requester is gone, which is
    /// never an error for the responder.
    pub fn reply(&self, reference: Ref, from: Id, reply: R) -> bool {
        self.tx.send(ReplyEnvelope { reference, from, reply }).is_ok()
    }
}

impl<R> Clone for ReplyTo<R> {
    fn clone(&self) -> Self {
        ReplyTo { tx: self.tx.clone() }
    }
}

impl<R> Debug for ReplyTo<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplyTo")
    }
}

/// The client side of the reply channel. Replies whose `Ref` has not been
/// asked for yet are stashed so that interleaved collections do not lose
/// them.
pub struct Inbox<R> {
    id: Id,
    tx: Sender<ReplyEnvelope<R>>,
    rx: Receiver<ReplyEnvelope<R>>,
    stash: RefCell<Vec<ReplyEnvelope<R>>>,
}

impl<R> Inbox<R> {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Inbox { id: Id::fresh(), tx, rx, stash: RefCell::new(Vec::new()) }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// The handle recipients use to answer this inbox.
    pub fn reply_to(&self) -> ReplyTo<R> {
        ReplyTo { tx: self.tx.clone() }
    }

    fn take_stashed(&self, reference: Ref) -> Option<ReplyEnvelope<R>> {
        let mut stash = self.stash.borrow_mut();
        let pos = stash.iter().position(|env| env.reference == reference)?;
        Some(stash.remove(pos))
    }

    /// Waits for the reply matching `reference`, up to `timeout`.
    pub fn collect(&self, reference: Ref, timeout: Duration) -> Result<R, Error> {
        if let Some(env) = self.take_stashed(reference) {
            return Ok(env.reply);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(Error::Timeout),
            };
            match self.rx.recv_timeout(remaining) {
                Ok(env) if env.reference == reference => return Ok(env.reply),
                Ok(env) => self.stash.borrow_mut().push(env),
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                // The inbox holds its own sender, so the channel cannot close.
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Timeout),
            }
        }
    }

    /// Waits for one reply matching `reference`, reporting who sent it.
    pub fn collect_any(&self, reference: Ref, timeout: Duration) -> Result<(Id, R), Error> {
        let mut responses = self.collect_many(reference, 1, timeout);
        if responses.is_empty() {
            Err(Error::Timeout)
        } else {
            Ok(responses.remove(0))
        }
    }

    /// Gathers replies matching `reference` from up to `k` distinct
    /// responders. Fewer than `k` responses indicate the timeout elapsed.
    pub fn collect_many(&self, reference: Ref, k: usize, timeout: Duration) -> Vec<(Id, R)> {
        let mut responses: Vec<(Id, R)> = Vec::new();
        {
            let mut stash = self.stash.borrow_mut();
            let mut i = 0;
            while i < stash.len() && responses.len() < k {
                if stash[i].reference == reference {
                    let env = stash.remove(i);
                    if !responses.iter().any(|(id, _)| *id == env.from) {
                        responses.push((env.from, env.reply));
                    }
                } else {
                    i += 1;
                }
            }
        }
        let deadline = Instant::now() + timeout;
        while responses.len() < k {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => break,
            };
            match self.rx.recv_timeout(remaining) {
                Ok(env) if env.reference == reference => {
                    if !responses.iter().any(|(id, _)| *id == env.from) {
                        responses.push((env.from, env.reply));
                    }
                }
                Ok(env) => self.stash.borrow_mut().push(env),
                Err(_) => break,
            }
        }
        responses
    }

    /// Gathers replies matching `reference` from all `expected` responders.
    pub fn collect_all(&self, reference: Ref, expected: usize, timeout: Duration) -> Vec<(Id, R)> {
        self.collect_many(reference, expected, timeout)
    }

    /// Discards stashed replies for a request that will not be collected
    /// again.
    pub fn forget(&self, reference: Ref) {
        self.stash.borrow_mut().retain(|env| env.reference != reference);
    }
}

impl<R> Default for Inbox<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends `msg` to `dst` under a fresh [`Ref`] and returns the token. The send
/// is fire-and-forget; a stopped destination is logged and ignored.
pub fn cast<T>(dst: &Address<T>, msg: T) -> Ref {
    let reference = Ref::fresh();
    if !dst.deliver(Envelope { reference, msg }) {
        log::debug!("Dropped cast to stopped mailbox. dst={}, ref={:?}", dst.id(), reference);
    }
    reference
}

/// Sends `msg` to every destination under one shared [`Ref`], so late
/// responses remain attributable by responder.
pub fn multicast<T: Clone>(dsts: &[Address<T>], msg: &T) -> Ref {
    let reference = Ref::fresh();
    for dst in dsts {
        if !dst.deliver(Envelope { reference, msg: msg.clone() }) {
            log::debug!("Dropped multicast leg. dst={}, ref={:?}", dst.id(), reference);
        }
    }
    reference
}

/// Sends the request built by `make` and retransmits every `retry` until the
/// matching reply arrives. There is no overall timeout; the call fails only
/// if the destination mailbox is gone.
pub fn call<T, R>(
    dst: &Address<T>,
    make: impl Fn(ReplyTo<R>) -> T,
    retry: Duration,
) -> Result<R, Error> {
    let inbox = Inbox::new();
    let reference = Ref::fresh();
    loop {
        if !dst.deliver(Envelope { reference, msg: make(inbox.reply_to()) }) {
            return Err(Error::ReplicaStopped);
        }
        match inbox.collect(reference, retry) {
            Ok(reply) => return Ok(reply),
            Err(Error::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Issues the request to every destination in parallel and returns once `n`
/// distinct responders have replied, retransmitting to the silent ones every
/// `retry`. Fails with [`Error::ReplicaStopped`] when the remaining
/// destinations are gone and no further reply can arrive.
pub fn multicall<T, R>(
    dsts: &[Address<T>],
    make: impl Fn(ReplyTo<R>) -> T,
    n: usize,
    retry: Duration,
) -> Result<Vec<(Id, R)>, Error> {
    if dsts.len() < n {
        return Err(Error::NoReplicas);
    }
    let inbox = Inbox::new();
    let reference = Ref::fresh();
    let mut responses: Vec<(Id, R)> = Vec::new();
    loop {
        let mut delivered = false;
        for dst in dsts {
            if responses.iter().any(|(id, _)| *id == dst.id()) {
                continue;
            }
            if dst.deliver(Envelope { reference, msg: make(inbox.reply_to()) }) {
                delivered = true;
            }
        }
        let before = responses.len();
        for (id, reply) in inbox.collect_many(reference, n - responses.len(), retry) {
            if !responses.iter().any(|(seen, _)| *seen == id) {
                responses.push((id, reply));
            }
        }
        if responses.len() >= n {
            return Ok(responses);
        }
        if !delivered && responses.len() == before {
            return Err(Error::ReplicaStopped);
        }
    }
}

/// [`multicall`] awaiting a single responder.
pub fn anycall<T, R>(
    dsts: &[Address<T>],
    make: impl Fn(ReplyTo<R>) -> T,
    retry: Duration,
) -> Result<(Id, R), Error> {
    multicall(dsts, make, 1, retry).map(|mut responses| responses.remove(0))
}

/// Locates `id` in a chain, returning its index, predecessor, and successor.
/// `None` in the predecessor slot marks the head; `None` in the successor
/// slot marks the tail.
pub fn ipn<T>(id: Id, chain: &[Address<T>]) -> Option<(usize, Option<&Address<T>>, Option<&Address<T>>)> {
    let index = chain.iter().position(|addr| addr.id() == id)?;
    let prev = if index == 0 { None } else { chain.get(index - 1) };
    Some((index, prev, chain.get(index + 1)))
}
