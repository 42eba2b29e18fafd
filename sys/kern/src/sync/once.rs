// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::err::{KernResult, Wait, WakeResult};
use crate::startup::Kernel;
use crate::thread::WaitChan;

use super::may_block;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
enum OnceState {
    #[default]
    New,
    Running,
    Done,
}

/// One-time initialization.
///
/// The first caller of `once_begin` gets `true` and runs the initializer,
/// then calls `once_complete`. Callers arriving meanwhile block until then;
/// later ones get `false` straight away.
#[derive(Debug, Default)]
pub struct Once {
    state: OnceState,
    chan: Option<WaitChan>,
}

impl Once {
    pub const fn new() -> Self {
        Self {
            state: OnceState::New,
            chan: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == OnceState::Done
    }
}

impl Kernel {
    pub fn once_begin(&mut self, o: &mut Once) -> KernResult<Wait<bool>> {
        match o.state {
            OnceState::New => {
                o.state = OnceState::Running;
                Ok(Wait::Done(true))
            }
            OnceState::Done => Ok(Wait::Done(false)),
            OnceState::Running => {
                may_block()?;
                let chan = self.sync_chan(&mut o.chan);
                self.block_current(Some(chan), None)?;
                Ok(Wait::Blocked)
            }
        }
    }

    pub fn once_complete(&mut self, o: &mut Once) {
        o.state = OnceState::Done;
        if let Some(chan) = o.chan.take() {
            let (_, hint) = self.wake_all(chan, WakeResult::Ready(0));
            self.finish(hint);
        }
    }

    /// Runs `init` unless it has run already. Only the uncontended case
    /// fits in one call; with the initializer still running elsewhere this
    /// blocks and the caller must not run `init` on wakeup.
    pub fn call_once(&mut self, o: &mut Once, init: impl FnOnce(&mut Kernel)) -> KernResult<Wait<()>> {
        let w = self.once_begin(o)?;
        if w == Wait::Done(true) {
            init(self);
            self.once_complete(o);
        }
        Ok(w.map(|_| ()))
    }
}
