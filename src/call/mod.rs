// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Continuation Engine
//!
//! Workflows of asynchronous steps, composed without threads. Every step is
//! a record in an arena addressed by a [`CallId`]; composites hold the ids
//! of their children, never references.
//!
//! - a simple call runs its work and continues with the value it produced,
//!   now or later through [`Calls::complete`],
//! - a sleep continues with its input after a delay,
//! - a step chains calls so each one continues into the next,
//! - a fork hands its input to every branch,
//! - a join waits for all of its branches then applies its completion once.
//!
//! A continuation is always re-entered through [`Loop::defer`], on the next
//! cycle, never from the call stack of the call that produced its value.
//! Records are released once fired and no longer referenced.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::reactor::{Loop, Reschedule};
use crate::{AppError, AppResult};

/// What a unit of work did with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<V> {
    /// Continue with this value.
    Done(V),
    /// The work continues later through [`Calls::complete`].
    Pending,
}

/// Stable handle of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    index: usize,
    generation: u32,
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}.{}", self.index, self.generation)
    }
}

pub type Work<V> = Box<dyn FnMut(&mut Loop, &Calls<V>, CallId, V) -> AppResult<Completion<V>>>;

enum Kind<V> {
    Simple(Option<Work<V>>),
    Sleep(Duration),
    Step { head: CallId, tail: CallId, members: Vec<CallId> },
    Fork(Vec<CallId>),
    Join { branches: usize, remaining: usize, completion: CallId },
}

struct Node<V> {
    kind: Kind<V>,
    continuation: Option<CallId>,
    fired: bool,
    retained: usize,
}

struct Slot<V> {
    generation: u32,
    node: Option<Node<V>>,
}

struct Arena<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    live: usize,
}

impl<V> Arena<V> {
    fn node(&self, id: CallId) -> AppResult<&Node<V>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or_else(|| AppError::IllegalStateError(format!("stale {}", id)))
    }

    fn node_mut(&mut self, id: CallId) -> AppResult<&mut Node<V>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or_else(|| AppError::IllegalStateError(format!("stale {}", id)))
    }

    fn insert(&mut self, kind: Kind<V>) -> CallId {
        let node = Node {
            kind,
            continuation: None,
            fired: false,
            retained: 0,
        };
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.node = Some(node);
            CallId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            CallId {
                index: self.slots.len() - 1,
                generation: 0,
            }
        }
    }
}

/// Arena of calls. Cloning shares the arena.
pub struct Calls<V> {
    arena: Rc<RefCell<Arena<V>>>,
}

impl<V> Clone for Calls<V> {
    fn clone(&self) -> Self {
        Calls {
            arena: self.arena.clone(),
        }
    }
}

impl<V> fmt::Debug for Calls<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calls")
            .field("live", &self.arena.borrow().live)
            .finish()
    }
}

impl<V> Default for Calls<V> {
    fn default() -> Self {
        Calls {
            arena: Rc::new(RefCell::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            })),
        }
    }
}

impl<V: Clone + 'static> Calls<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records not yet released.
    pub fn live(&self) -> usize {
        self.arena.borrow().live
    }

    /// A call that maps its input to the value it continues with.
    pub fn call<F>(&self, mut work: F) -> CallId
    where
        F: FnMut(&mut Loop, V) -> AppResult<V> + 'static,
    {
        self.call_pending(move |lp, _, _, value| work(lp, value).map(Completion::Done))
    }

    /// A call whose work may finish later, through [`Calls::complete`].
    pub fn call_pending<F>(&self, work: F) -> CallId
    where
        F: FnMut(&mut Loop, &Calls<V>, CallId, V) -> AppResult<Completion<V>> + 'static,
    {
        self.arena.borrow_mut().insert(Kind::Simple(Some(Box::new(work))))
    }

    /// Continues with its input after `delay`.
    pub fn sleep(&self, delay: Duration) -> CallId {
        self.arena.borrow_mut().insert(Kind::Sleep(delay))
    }

    /// Chains `members` so each one continues into the next. Continuing the
    /// step continues its last member.
    pub fn step(&self, members: &[CallId]) -> AppResult<CallId> {
        let (&head, rest) = members
            .split_first()
            .ok_or_else(|| AppError::InvalidValue("empty step".into()))?;
        let mut previous = head;
        for &member in rest {
            self.then(previous, member)?;
            previous = member;
        }
        let tail = self.tail(previous)?;
        for &member in members {
            self.retain(member)?;
        }
        Ok(self.arena.borrow_mut().insert(Kind::Step {
            head,
            tail,
            members: members.to_vec(),
        }))
    }

    /// Applies every branch to the same input, in order.
    pub fn fork(&self, branches: &[CallId]) -> AppResult<CallId> {
        for &branch in branches {
            self.retain(branch)?;
        }
        Ok(self.arena.borrow_mut().insert(Kind::Fork(branches.to_vec())))
    }

    /// Adds `next` as one more continuation of `call`, next to the one it
    /// already has.
    pub fn branch(&self, call: CallId, next: CallId) -> AppResult<()> {
        let call = self.tail(call)?;
        let existing = self.arena.borrow().node(call)?.continuation;
        match existing {
            None => self.then(call, next),
            Some(existing) => {
                let forked = matches!(self.arena.borrow().node(existing)?.kind, Kind::Fork(_));
                if forked {
                    self.retain(next)?;
                    if let Kind::Fork(branches) = &mut self.arena.borrow_mut().node_mut(existing)?.kind {
                        branches.push(next);
                    }
                    Ok(())
                } else {
                    let fork = self.fork(&[existing, next])?;
                    self.set_continuation(call, fork)
                }
            }
        }
    }

    /// Applies `completion` once, with the last value, after every branch
    /// continued into the join.
    pub fn join(&self, branches: &[CallId], completion: CallId) -> AppResult<CallId> {
        if branches.is_empty() {
            return Err(AppError::InvalidValue("empty join".into()));
        }
        self.retain(completion)?;
        let join = self.arena.borrow_mut().insert(Kind::Join {
            branches: branches.len(),
            remaining: branches.len(),
            completion,
        });
        for &branch in branches {
            self.then(branch, join)?;
        }
        Ok(join)
    }

    /// Makes `next` the continuation of `call`.
    pub fn then(&self, call: CallId, next: CallId) -> AppResult<()> {
        let call = self.tail(call)?;
        self.set_continuation(call, next)
    }

    /// Applies `id` to `value` on the next cycle.
    pub fn start(&self, lp: &mut Loop, id: CallId, value: V) -> AppResult<()> {
        self.retain(id)?;
        self.defer_apply(lp, id, value);
        Ok(())
    }

    /// Continues a pending call with `value`.
    pub fn complete(&self, lp: &mut Loop, id: CallId, value: V) -> AppResult<()> {
        let fired = self.arena.borrow().node(id)?.fired;
        if fired {
            return Err(AppError::IllegalStateError(format!("{} already completed", id)));
        }
        self.fire(lp, id, value)
    }

    /// Applies `id` to `value` now.
    pub fn apply(&self, lp: &mut Loop, id: CallId, value: V) -> AppResult<()> {
        enum Action<V> {
            Simple(Work<V>),
            Sleep(Duration),
            Step(CallId),
            Fork(Vec<CallId>),
            Join(Option<CallId>),
        }

        let action = {
            let mut arena = self.arena.borrow_mut();
            let node = arena.node_mut(id)?;
            match &mut node.kind {
                Kind::Simple(work) => match work.take() {
                    Some(work) => Action::Simple(work),
                    None => {
                        return Err(AppError::IllegalStateError(format!("{} is running", id)));
                    }
                },
                Kind::Sleep(delay) => Action::Sleep(*delay),
                Kind::Step { head, .. } => {
                    node.fired = true;
                    Action::Step(*head)
                }
                Kind::Fork(branches) => {
                    node.fired = true;
                    Action::Fork(branches.clone())
                }
                Kind::Join {
                    branches,
                    remaining,
                    completion,
                } => {
                    if *remaining == 0 {
                        return Err(AppError::IllegalStateError(format!(
                            "{} already joined its {} branches",
                            id, branches
                        )));
                    }
                    *remaining -= 1;
                    if *remaining == 0 {
                        node.fired = true;
                        Action::Join(Some(*completion))
                    } else {
                        Action::Join(None)
                    }
                }
            }
        };

        match action {
            Action::Simple(mut work) => {
                let result = work(lp, self, id, value);
                // put the work back unless the record is gone
                if let Ok(node) = self.arena.borrow_mut().node_mut(id) {
                    if let Kind::Simple(slot) = &mut node.kind {
                        *slot = Some(work);
                    }
                    // a failed call never continues, release it like a fired one
                    if result.is_err() {
                        node.fired = true;
                    }
                }
                if result.is_err() {
                    self.collect(id);
                }
                match result? {
                    Completion::Done(value) => self.fire(lp, id, value)?,
                    Completion::Pending => trace!("{} pending", id),
                }
            }
            Action::Sleep(delay) => {
                let calls = self.clone();
                let mut value = Some(value);
                lp.timeout(delay, move |lp, _| {
                    if let Some(value) = value.take() {
                        calls.fire(lp, id, value)?;
                    }
                    Ok(Reschedule::Never)
                });
            }
            Action::Step(head) => {
                let result = self.apply(lp, head, value);
                self.collect(id);
                result?;
            }
            Action::Fork(branches) => {
                for branch in branches {
                    self.retain(branch)?;
                    self.defer_apply(lp, branch, value.clone());
                }
                self.collect(id);
            }
            Action::Join(Some(completion)) => {
                let result = self.apply(lp, completion, value);
                self.collect(id);
                result?;
            }
            Action::Join(None) => {}
        }
        Ok(())
    }

    fn defer_apply(&self, lp: &mut Loop, id: CallId, value: V) {
        let calls = self.clone();
        lp.defer(move |lp| {
            let result = calls.apply(lp, id, value);
            calls.release(id);
            result
        });
    }

    /// Marks `id` fired and re-enters its continuation on the next cycle.
    fn fire(&self, lp: &mut Loop, id: CallId, value: V) -> AppResult<()> {
        let continuation = {
            let mut arena = self.arena.borrow_mut();
            let node = arena.node_mut(id)?;
            node.fired = true;
            node.continuation
        };
        if let Some(next) = continuation {
            self.retain(next)?;
            self.defer_apply(lp, next, value);
        }
        self.collect(id);
        Ok(())
    }

    /// Last member of a step, the call itself otherwise.
    fn tail(&self, id: CallId) -> AppResult<CallId> {
        let arena = self.arena.borrow();
        let mut id = id;
        while let Kind::Step { tail, .. } = arena.node(id)?.kind {
            id = tail;
        }
        Ok(id)
    }

    fn set_continuation(&self, call: CallId, next: CallId) -> AppResult<()> {
        if let Kind::Fork(_) = self.arena.borrow().node(call)?.kind {
            return Err(AppError::InvalidOperation(format!(
                "fork {} has no continuation of its own",
                call
            )));
        }
        self.retain(next)?;
        let previous = self.arena.borrow_mut().node_mut(call)?.continuation.replace(next);
        if let Some(previous) = previous {
            self.release(previous);
        }
        Ok(())
    }

    fn retain(&self, id: CallId) -> AppResult<()> {
        self.arena.borrow_mut().node_mut(id)?.retained += 1;
        Ok(())
    }

    fn release(&self, id: CallId) {
        if let Ok(node) = self.arena.borrow_mut().node_mut(id) {
            node.retained = node.retained.saturating_sub(1);
        }
        self.collect(id);
    }

    /// Frees `id` if it fired and nothing holds it, then what it held.
    fn collect(&self, id: CallId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let mut arena = self.arena.borrow_mut();
            let Ok(node) = arena.node(id) else {
                continue;
            };
            if !node.fired || node.retained > 0 {
                continue;
            }
            let slot = &mut arena.slots[id.index];
            let Some(node) = slot.node.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            arena.free.push(id.index);
            arena.live -= 1;
            drop(arena);
            trace!("{} released", id);

            let mut held: Vec<CallId> = node.continuation.into_iter().collect();
            match node.kind {
                Kind::Step { members, .. } => held.extend(members),
                Kind::Fork(branches) => held.extend(branches),
                Kind::Join { completion, .. } => held.push(completion),
                Kind::Simple(_) | Kind::Sleep(_) => {}
            }
            for child in held {
                if let Ok(node) = self.arena.borrow_mut().node_mut(child) {
                    node.retained = node.retained.saturating_sub(1);
                }
                pending.push(child);
            }
        }
    }
}
