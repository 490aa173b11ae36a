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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;

use crate::AppResult;

/// Termination signal observed by the loop between two cycles.
///
/// The signal handler only raises a flag; the loop polls it with `recv`
/// and turns it into an exit request for its exit predicates.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new(notify: Arc<AtomicBool>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Registers the flag for SIGINT, SIGTERM and SIGQUIT.
    pub fn install() -> AppResult<Shutdown> {
        let notify = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, notify.clone())?;
        }
        Ok(Shutdown::new(notify))
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Consumes a pending signal, `true` if one was raised since the last call.
    pub fn recv(&mut self) -> bool {
        if self.notify.swap(false, Ordering::SeqCst) {
            self.is_shutdown = true;
            true
        } else {
            false
        }
    }
}
