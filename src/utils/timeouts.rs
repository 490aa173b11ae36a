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

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::reactor::{Loop, Reschedule};
use crate::AppResult;

pub type TimeoutCallback<T> = Box<dyn FnMut(&mut Loop, &Timeouts<T>, T) -> AppResult<()>>;

struct Inner<T> {
    period: Duration,
    precision: Duration,
    deque: VecDeque<(Instant, T)>,
    on_timeout: Option<TimeoutCallback<T>>,
    running: bool,
}

/// A deque of references that time out `period` after they were pushed.
///
/// One self-rescheduling timer, checking every `precision`, hands each
/// expired reference to the callback in push order. The timer stops when
/// the deque is empty and starts again on the next push. Cloning shares
/// the deque.
pub struct Timeouts<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Timeouts<T> {
    fn clone(&self) -> Self {
        Timeouts {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Timeouts<T> {
    /// `period` and `precision` are raised to the loop's precision.
    pub fn new<F>(lp: &Loop, period: Duration, precision: Duration, on_timeout: F) -> Self
    where
        F: FnMut(&mut Loop, &Timeouts<T>, T) -> AppResult<()> + 'static,
    {
        Timeouts {
            inner: Rc::new(RefCell::new(Inner {
                period: period.max(lp.precision()),
                precision: precision.max(lp.precision()),
                deque: VecDeque::new(),
                on_timeout: Some(Box::new(on_timeout)),
                running: false,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, lp: &mut Loop, reference: T) {
        let start = {
            let mut inner = self.inner.borrow_mut();
            inner.deque.push_back((lp.now(), reference));
            !std::mem::replace(&mut inner.running, true)
        };
        if start {
            let precision = self.inner.borrow().precision;
            let timeouts = self.clone();
            lp.timeout(precision, move |lp, now| timeouts.expire(lp, now));
        }
    }

    fn expire(&self, lp: &mut Loop, now: Instant) -> AppResult<Reschedule> {
        let (expired, callback) = {
            let mut inner = self.inner.borrow_mut();
            let mut expired = Vec::new();
            while let Some((when, _)) = inner.deque.front() {
                if now.saturating_duration_since(*when) < inner.period {
                    break;
                }
                if let Some((_, reference)) = inner.deque.pop_front() {
                    expired.push(reference);
                }
            }
            let callback = if expired.is_empty() {
                None
            } else {
                inner.on_timeout.take()
            };
            (expired, callback)
        };

        if let Some(mut callback) = callback {
            for reference in expired {
                if let Err(e) = callback(lp, self, reference) {
                    lp.log_error(&e);
                }
            }
            self.inner.borrow_mut().on_timeout = Some(callback);
        }

        let mut inner = self.inner.borrow_mut();
        if inner.deque.is_empty() {
            inner.running = false;
            Ok(Reschedule::Never)
        } else {
            Ok(Reschedule::At(now + inner.precision))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::service::ReactorConfig;

    fn fine_loop() -> Loop {
        Loop::with_config(&ReactorConfig {
            precision_ms: 10,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn references_expire_in_push_order_then_the_timer_stops() {
        let mut lp = fine_loop();
        let expired = Rc::new(RefCell::new(Vec::new()));
        let sink = expired.clone();
        let timeouts = Timeouts::new(
            &lp,
            Duration::from_millis(30),
            Duration::from_millis(10),
            move |lp, _, reference: &'static str| {
                sink.borrow_mut().push((reference, lp.now()));
                Ok(())
            },
        );
        let pushed = lp.now();
        timeouts.push(&mut lp, "first");
        timeouts.push(&mut lp, "second");

        lp.dispatch().unwrap();
        let expired = expired.borrow();
        assert_eq!(
            expired.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(expired[0].1.duration_since(pushed) >= Duration::from_millis(30));
        assert!(timeouts.is_empty());
        assert_eq!(lp.scheduled(), 0);
    }

    #[test]
    fn callback_may_push_again() {
        let mut lp = fine_loop();
        let rounds = Rc::new(Cell::new(0));
        let counter = rounds.clone();
        let timeouts = Timeouts::new(
            &lp,
            Duration::from_millis(10),
            Duration::from_millis(10),
            move |lp, timeouts: &Timeouts<u32>, n| {
                counter.set(counter.get() + 1);
                if n < 2 {
                    timeouts.push(lp, n + 1);
                }
                Ok(())
            },
        );
        timeouts.push(&mut lp, 0);
        lp.dispatch().unwrap();
        assert_eq!(rounds.get(), 3);
    }
}
