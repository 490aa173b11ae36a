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

//! Reactor Loop Implementation
//!
//! One loop multiplexes every channel of the process on a single thread.
//! Each cycle of [`Loop::dispatch`]:
//!
//! 1. consults the exit predicates if an exit was requested,
//! 2. refreshes the poll interest of every dispatcher from its
//!    `readable()` / `writable()` predicates,
//! 3. polls the multiplexer, waiting at most until the nearest timer,
//! 4. calls the dispatchers that are ready, in registration order,
//! 5. fires the timers that are due, in due order,
//! 6. runs the continuations deferred before this cycle.
//!
//! mio reports readiness edge-triggered. The loop keeps the readiness a
//! handler did not exhaust and hands it back on the next cycle, which gives
//! dispatchers the level-triggered view they are written against.
//!
//! Nothing a dispatcher, timer or continuation returns can stop the loop:
//! errors are logged on the logger's traceback channel, the dispatcher is
//! closed or the timer dropped, and the cycle goes on.

pub use dispatcher::{Dispatcher, Ready};
pub use listener::Listener;
pub use loginfo::{Loginfo, TracingLog};
pub use timer::{Reschedule, TimerCallback, TimerId, TimerQueue};

mod dispatcher;
mod listener;
mod loginfo;
mod timer;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use crate::service::{ReactorConfig, Shutdown, MIN_PRECISION_MS};
use crate::{AppError, AppResult};

const EVENTS_CAPACITY: usize = 1024;

/// A continuation deferred to the next cycle.
pub type Continuation = Box<dyn FnOnce(&mut Loop) -> AppResult<()>>;

/// Consulted when an exit is requested, with the reason of the request.
pub type ExitPredicate = Box<dyn FnMut(&mut Loop, &str) -> ExitVote>;

/// Answer of an exit predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVote {
    /// Veto the exit, the predicate stays installed.
    Continue,
    /// Allow the exit, the predicate is removed.
    Exit,
}

struct Registration {
    dispatcher: Rc<RefCell<dyn Dispatcher>>,
    interest: Option<Interest>,
    ready: Ready,
}

pub struct Loop {
    poll: Poll,
    events: Events,
    dispatched: BTreeMap<Token, Registration>,
    next_token: usize,
    timers: TimerQueue,
    firing: Vec<TimerId>,
    firing_cancelled: HashSet<TimerId>,
    continued: VecDeque<Continuation>,
    exits: Vec<ExitPredicate>,
    exit_requested: Option<String>,
    shutdown: Option<Shutdown>,
    log: Box<dyn Loginfo>,
    now: Instant,
    precision: Duration,
    concurrency: usize,
    concurrent: usize,
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("dispatched", &self.dispatched.len())
            .field("scheduled", &self.timers.len())
            .field("continued", &self.continued.len())
            .field("exits", &self.exits.len())
            .field("precision", &self.precision)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

fn interest(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Loop {
    pub fn new() -> AppResult<Loop> {
        Loop::with_config(&ReactorConfig::default())
    }

    pub fn with_config(config: &ReactorConfig) -> AppResult<Loop> {
        if config.precision_ms < MIN_PRECISION_MS {
            return Err(AppError::InvalidValue(format!(
                "precision {}ms lower than {}ms",
                config.precision_ms, MIN_PRECISION_MS
            )));
        }
        Ok(Loop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            dispatched: BTreeMap::new(),
            next_token: 0,
            timers: TimerQueue::new(),
            firing: Vec::new(),
            firing_cancelled: HashSet::new(),
            continued: VecDeque::new(),
            exits: Vec::new(),
            exit_requested: None,
            shutdown: None,
            log: Box::new(TracingLog),
            now: Instant::now(),
            precision: Duration::from_millis(config.precision_ms),
            concurrency: config.concurrency.max(1),
            concurrent: 0,
        })
    }

    /// Time sampled at the start of the current cycle (or after its poll).
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn precision(&self) -> Duration {
        self.precision
    }

    pub fn set_precision(&mut self, precision: Duration) -> AppResult<()> {
        if precision < Duration::from_millis(MIN_PRECISION_MS) {
            return Err(AppError::InvalidValue(format!(
                "precision {:?} lower than {}ms",
                precision, MIN_PRECISION_MS
            )));
        }
        self.precision = precision;
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of dispatchers with a non-empty interest in the last cycle.
    pub fn concurrent(&self) -> usize {
        self.concurrent
    }

    /// Number of dispatchers in the loop.
    pub fn dispatched(&self) -> usize {
        self.dispatched.len()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.dispatched.contains_key(&token)
    }

    /// Adds a dispatcher; it is registered with the multiplexer at the start
    /// of the next cycle.
    pub fn add<D: Dispatcher + 'static>(&mut self, dispatcher: Rc<RefCell<D>>) -> AppResult<Token> {
        let token = Token(self.next_token);
        dispatcher
            .try_borrow_mut()
            .map_err(|_| AppError::IllegalStateError("dispatcher added while borrowed".into()))?
            .attach(token);
        self.next_token += 1;
        self.dispatched.insert(
            token,
            Registration {
                dispatcher,
                interest: None,
                ready: Ready::NONE,
            },
        );
        trace!("dispatcher {:?} added", token);
        Ok(token)
    }

    /// Removes a dispatcher, deregistering its source if it was polled.
    /// Called by dispatchers when they close.
    pub fn remove(&mut self, token: Token, source: Option<&mut dyn Source>) {
        if let Some(registration) = self.dispatched.remove(&token) {
            if registration.interest.is_some() {
                if let Some(source) = source {
                    if let Err(e) = self.poll.registry().deregister(source) {
                        let error = AppError::from(e);
                        self.log_error(&error);
                    }
                }
            }
            trace!("dispatcher {:?} removed", token);
        }
    }

    /// Schedules `callback` at `when`. The callback receives the loop's time
    /// and returns `Reschedule::At` to fire again or `Reschedule::Never`.
    pub fn schedule<F>(&mut self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut(&mut Loop, Instant) -> AppResult<Reschedule> + 'static,
    {
        self.timers.insert(when, Box::new(callback))
    }

    pub fn timeout<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut Loop, Instant) -> AppResult<Reschedule> + 'static,
    {
        let when = self.now + delay;
        self.schedule(when, callback)
    }

    /// Cancels a scheduled event, including one cancelling itself while it
    /// fires or one due in the batch being fired.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.firing.contains(&id) {
            self.firing_cancelled.insert(id)
        } else {
            self.timers.cancel(id)
        }
    }

    pub fn scheduled(&self) -> usize {
        self.timers.len()
    }

    /// Defers `continuation` to the next cycle.
    pub fn defer<F>(&mut self, continuation: F)
    where
        F: FnOnce(&mut Loop) -> AppResult<()> + 'static,
    {
        self.continued.push_back(Box::new(continuation));
    }

    pub fn add_exit<F>(&mut self, predicate: F)
    where
        F: FnMut(&mut Loop, &str) -> ExitVote + 'static,
    {
        self.exits.push(Box::new(predicate));
    }

    /// Requests the loop to exit, subject to its exit predicates.
    pub fn exit(&mut self, reason: &str) {
        debug!("exit requested: {}", reason);
        self.exit_requested = Some(reason.to_string());
    }

    /// Turns SIGINT, SIGTERM and SIGQUIT into exit requests.
    pub fn hook_shutdown(&mut self) -> AppResult<()> {
        if self.shutdown.is_none() {
            self.shutdown = Some(Shutdown::install()?);
        }
        Ok(())
    }

    /// Replaces the logger sink and returns the previous one.
    pub fn set_logger(&mut self, log: Box<dyn Loginfo>) -> Box<dyn Loginfo> {
        std::mem::replace(&mut self.log, log)
    }

    /// Installs the sink built by `wrap` around the current one.
    pub fn wrap_logger<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn Loginfo>) -> Box<dyn Loginfo>,
    {
        let previous = std::mem::replace(&mut self.log, Box::new(TracingLog));
        self.log = wrap(previous);
    }

    pub fn log(&mut self, message: &str) {
        self.log.out(message);
    }

    pub fn log_category(&mut self, category: &str, message: &str) {
        self.log.err(category, message);
    }

    pub fn log_error(&mut self, error: &AppError) {
        self.log.traceback(error);
    }

    fn has_work(&self) -> bool {
        !self.dispatched.is_empty() || !self.timers.is_empty() || !self.continued.is_empty()
    }

    /// Runs cycles until nothing is left to dispatch or an exit request is
    /// not vetoed. Fails only if the multiplexer itself fails.
    pub fn dispatch(&mut self) -> AppResult<()> {
        while self.has_work() {
            self.now = Instant::now();
            if self.exiting() {
                debug!("loop exit");
                break;
            }
            self.dispatch_io()?;
            self.dispatch_scheduled();
            self.dispatch_continuations();
        }
        Ok(())
    }

    fn exiting(&mut self) -> bool {
        if let Some(shutdown) = self.shutdown.as_mut() {
            if shutdown.recv() && self.exit_requested.is_none() {
                self.exit_requested = Some("signal".to_string());
            }
        }
        let Some(reason) = self.exit_requested.take() else {
            return false;
        };
        let predicates = std::mem::take(&mut self.exits);
        let mut kept = Vec::with_capacity(predicates.len());
        for mut predicate in predicates {
            if predicate(self, &reason) == ExitVote::Continue {
                kept.push(predicate);
            }
        }
        let exit = kept.is_empty();
        // predicates installed while consulting the chain are kept as well
        kept.append(&mut self.exits);
        self.exits = kept;
        exit
    }

    fn dispatch_io(&mut self) -> AppResult<()> {
        self.concurrent = 0;
        let mut cached = false;
        let tokens: Vec<Token> = self.dispatched.keys().copied().collect();
        for token in tokens {
            let Some(registration) = self.dispatched.get(&token) else {
                continue;
            };
            let dispatcher = registration.dispatcher.clone();
            let current = registration.interest;
            let ready = registration.ready;
            let Ok(mut d) = dispatcher.try_borrow_mut() else {
                continue;
            };
            let (readable, writable) = if self.concurrent < self.concurrency {
                (d.readable(), d.writable())
            } else {
                (false, false)
            };
            let wanted = interest(readable, writable);
            if wanted != current {
                let registry = self.poll.registry();
                let result = match (d.source(), current, wanted) {
                    (Some(source), None, Some(wanted)) => registry.register(source, token, wanted),
                    (Some(source), Some(_), Some(wanted)) => {
                        registry.reregister(source, token, wanted)
                    }
                    (Some(source), Some(_), None) => registry.deregister(source),
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    let error = AppError::from(e);
                    self.log_error(&error);
                    d.handle_error(self, error);
                    continue;
                }
                if let Some(registration) = self.dispatched.get_mut(&token) {
                    registration.interest = wanted;
                }
            }
            if wanted.is_some() {
                self.concurrent += 1;
                if (ready.readable && readable) || (ready.writable && writable) {
                    cached = true;
                }
            }
        }

        let timeout = if cached || !self.continued.is_empty() {
            Some(Duration::ZERO)
        } else {
            let next = self
                .timers
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()));
            let cap = if self.concurrent == 0 || self.shutdown.is_some() {
                Some(self.precision)
            } else {
                None
            };
            match (next, cap) {
                (Some(next), Some(cap)) => Some(next.min(cap)),
                (Some(next), None) => Some(next),
                (None, cap) => cap,
            }
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
        self.now = Instant::now();

        let observed: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| {
                let ready = Ready {
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                };
                (event.token(), ready)
            })
            .collect();
        for (token, ready) in observed {
            if let Some(registration) = self.dispatched.get_mut(&token) {
                registration.ready = registration.ready.merge(ready);
            }
        }

        let ready: Vec<Token> = self
            .dispatched
            .iter()
            .filter(|(_, registration)| !registration.ready.is_empty())
            .map(|(token, _)| *token)
            .collect();
        for token in ready {
            self.handle(token);
        }
        Ok(())
    }

    fn handle(&mut self, token: Token) {
        let Some(registration) = self.dispatched.get_mut(&token) else {
            return;
        };
        let ready = std::mem::take(&mut registration.ready);
        let dispatcher = registration.dispatcher.clone();
        let Ok(mut d) = dispatcher.try_borrow_mut() else {
            registration.ready = ready;
            return;
        };
        let masked = Ready {
            readable: ready.readable && d.readable(),
            writable: ready.writable && d.writable(),
        };
        let unused = Ready {
            readable: ready.readable && !masked.readable,
            writable: ready.writable && !masked.writable,
        };
        let left = if masked.is_empty() {
            Ready::NONE
        } else {
            match d.handle(self, masked) {
                Ok(left) => left,
                Err(e) => {
                    self.log_error(&e);
                    d.handle_error(self, e);
                    Ready::NONE
                }
            }
        };
        if let Some(registration) = self.dispatched.get_mut(&token) {
            registration.ready = registration.ready.merge(left).merge(unused);
        }
    }

    fn dispatch_scheduled(&mut self) {
        self.now = Instant::now();
        let now = self.now;
        let due = self.timers.pop_due(now);
        self.firing = due.iter().map(|event| event.id).collect();
        for event in due {
            let id = event.id;
            if self.firing_cancelled.remove(&id) {
                self.firing.retain(|firing| *firing != id);
                continue;
            }
            let mut callback = event.callback;
            let result = callback(self, now);
            self.firing.retain(|firing| *firing != id);
            let cancelled = self.firing_cancelled.remove(&id);
            match result {
                Ok(Reschedule::At(when)) if !cancelled => self.timers.reinsert(id, when, callback),
                Ok(_) => {}
                Err(e) => self.log_error(&e),
            }
        }
        self.firing.clear();
        self.firing_cancelled.clear();
    }

    fn dispatch_continuations(&mut self) {
        let continued = std::mem::take(&mut self.continued);
        for continuation in continued {
            if let Err(e) = continuation(self) {
                self.log_error(&e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use rstest::{fixture, rstest};

    use crate::service::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    #[derive(Default)]
    struct Recorder {
        out: Vec<String>,
        err: Vec<(String, String)>,
        tracebacks: Vec<String>,
    }

    struct SharedLog(Rc<RefCell<Recorder>>);

    impl Loginfo for SharedLog {
        fn out(&mut self, message: &str) {
            self.0.borrow_mut().out.push(message.to_string());
        }
        fn err(&mut self, category: &str, message: &str) {
            self.0
                .borrow_mut()
                .err
                .push((category.to_string(), message.to_string()));
        }
        fn traceback(&mut self, error: &AppError) {
            self.0.borrow_mut().tracebacks.push(error.to_string());
        }
    }

    #[rstest]
    fn timers_fire_in_due_order(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for (label, delay) in [("c", 30), ("a", 10), ("b", 10)] {
            let fired = fired.clone();
            lp.timeout(Duration::from_millis(delay), move |_, _| {
                fired.borrow_mut().push(label);
                Ok(Reschedule::Never)
            });
        }
        lp.dispatch().unwrap();
        assert_eq!(*fired.borrow(), vec!["a", "b", "c"]);
    }

    #[rstest]
    fn self_rescheduling_timer_stops_on_never(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        lp.timeout(Duration::ZERO, move |_, now| {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                Ok(Reschedule::At(now + Duration::from_millis(5)))
            } else {
                Ok(Reschedule::Never)
            }
        });
        lp.dispatch().unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(lp.scheduled(), 0);
    }

    #[rstest]
    fn timers_scheduled_while_firing_wait_for_a_later_cycle(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let outer = order.clone();
        lp.timeout(Duration::ZERO, move |lp, now| {
            outer.borrow_mut().push("outer");
            let inner = outer.clone();
            lp.schedule(now, move |_, _| {
                inner.borrow_mut().push("inner");
                Ok(Reschedule::Never)
            });
            // still due in this cycle, must not fire before the deferred continuation
            let deferred = outer.clone();
            lp.defer(move |_| {
                deferred.borrow_mut().push("deferred");
                Ok(())
            });
            Ok(Reschedule::Never)
        });
        lp.dispatch().unwrap();
        assert_eq!(*order.borrow(), vec!["outer", "deferred", "inner"]);
    }

    #[rstest]
    fn failing_timer_is_logged_and_dropped(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        lp.set_logger(Box::new(SharedLog(recorder.clone())));
        let runs = Rc::new(Cell::new(0));
        let failing = runs.clone();
        lp.timeout(Duration::ZERO, move |_, _| {
            failing.set(failing.get() + 1);
            Err(AppError::IllegalStateError("boom".into()))
        });
        let survived = Rc::new(Cell::new(false));
        let flag = survived.clone();
        lp.timeout(Duration::from_millis(5), move |_, _| {
            flag.set(true);
            Ok(Reschedule::Never)
        });
        lp.dispatch().unwrap();
        assert_eq!(runs.get(), 1);
        assert!(survived.get());
        assert_eq!(recorder.borrow().tracebacks, vec!["illegal state: boom".to_string()]);
    }

    #[rstest]
    fn cancelled_timer_never_fires(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let id = lp.timeout(Duration::from_millis(10), move |_, _| {
            flag.set(true);
            Ok(Reschedule::Never)
        });
        assert!(lp.cancel(id));
        lp.dispatch().unwrap();
        assert!(!fired.get());
    }

    #[rstest]
    fn timer_can_cancel_itself_while_firing(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let id = Rc::new(Cell::new(None));
        let counter = count.clone();
        let own = id.clone();
        let timer = lp.timeout(Duration::ZERO, move |lp, now| {
            counter.set(counter.get() + 1);
            if let Some(own) = own.get() {
                lp.cancel(own);
            }
            Ok(Reschedule::At(now + Duration::from_millis(1)))
        });
        id.set(Some(timer));
        lp.dispatch().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[rstest]
    fn exit_predicates_can_veto(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let consulted = Rc::new(Cell::new(0));
        let votes = consulted.clone();
        lp.add_exit(move |_, reason| {
            assert_eq!(reason, "test");
            votes.set(votes.get() + 1);
            if votes.get() == 1 {
                ExitVote::Continue
            } else {
                ExitVote::Exit
            }
        });
        // keeps the loop busy forever unless the exit goes through
        lp.timeout(Duration::ZERO, |lp, now| {
            lp.exit("test");
            Ok(Reschedule::At(now + Duration::from_millis(10)))
        });
        lp.dispatch().unwrap();
        assert_eq!(consulted.get(), 2);
        assert_eq!(lp.scheduled(), 1);
    }

    #[rstest]
    fn logger_channels_are_routed_to_the_sink(_setup: ()) {
        let mut lp = Loop::new().unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let previous = lp.set_logger(Box::new(SharedLog(recorder.clone())));
        lp.log("hello");
        lp.log_category("DEBUG", "details");
        lp.log_error(&AppError::InvalidValue("x".into()));
        lp.set_logger(previous);
        lp.log("not recorded");

        let recorder = recorder.borrow();
        assert_eq!(recorder.out, vec!["hello".to_string()]);
        assert_eq!(
            recorder.err,
            vec![("DEBUG".to_string(), "details".to_string())]
        );
        assert_eq!(recorder.tracebacks, vec!["invalid value: x".to_string()]);
    }

    #[test]
    fn precision_below_ten_milliseconds_is_rejected() {
        let config = ReactorConfig {
            precision_ms: 5,
            ..Default::default()
        };
        assert!(Loop::with_config(&config).is_err());
        let mut lp = Loop::new().unwrap();
        assert!(lp.set_precision(Duration::from_millis(1)).is_err());
        assert!(lp.set_precision(Duration::from_millis(50)).is_ok());
        assert_eq!(lp.precision(), Duration::from_millis(50));
    }
}
