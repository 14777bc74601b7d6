// (c) Roel Kluin, 2023, GPL v3

use crate::cancel::{CancelToken, HookId};
use crate::dispatch::SeqId;
use crate::error::PipelineError;
use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

struct Turn {
    next: u64,
    skipped: BTreeSet<u64>,
    interrupted: bool,
}

impl Turn {
    fn advance(&mut self) {
        self.next += 1;
        while self.skipped.remove(&self.next) {
            self.next += 1;
        }
    }
}

struct Gate {
    turn: Mutex<Turn>,
    changed: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interrupt(&self) {
        self.lock().interrupted = true;
        self.changed.notify_all();
    }
}

/// Passes the turn on when dropped, also when the write panics.
struct PassTurn<'a>(&'a Gate);

impl Drop for PassTurn<'_> {
    fn drop(&mut self) {
        self.0.lock().advance();
        self.0.changed.notify_all();
    }
}

/// Link from a `CancelToken` to an `OrderedSink`, removed on drop.
#[must_use = "the sink is no longer watched once this is dropped"]
pub struct Watch {
    token: CancelToken,
    hook: HookId,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.token.remove_hook(self.hook);
    }
}

/// Lets workers that finish out of order write to one sink in range order.
///
/// A worker with the result of range `id` calls `write(id, ..)` and blocks until all ranges
/// before `id` were written or skipped. There is no timeout: a range that is never written nor
/// skipped stalls every later one until the sink is interrupted.
pub struct OrderedSink<S> {
    gate: Arc<Gate>,
    sink: Mutex<S>,
}

impl<S> OrderedSink<S> {
    pub fn new(sink: S) -> Self {
        OrderedSink {
            gate: Arc::new(Gate {
                turn: Mutex::new(Turn {
                    next: 0,
                    skipped: BTreeSet::new(),
                    interrupted: false,
                }),
                changed: Condvar::new(),
            }),
            sink: Mutex::new(sink),
        }
    }

    /// The range whose write is due.
    pub fn next_turn(&self) -> SeqId {
        SeqId(self.gate.lock().next)
    }

    pub fn is_interrupted(&self) -> bool {
        self.gate.lock().interrupted
    }

    /// Wakes all waiters. Those whose turn has not come fail with
    /// `PipelineError::TurnInterrupted`; the turn due can still be written.
    pub fn interrupt(&self) {
        self.gate.interrupt();
    }

    /// Interrupts this sink when `token` is cancelled, for as long as the returned `Watch`
    /// lives.
    pub fn watch(&self, token: &CancelToken) -> Watch {
        let gate = Arc::downgrade(&self.gate);
        let hook = token.on_cancel(move || {
            if let Some(gate) = gate.upgrade() {
                gate.interrupt();
            }
        });
        Watch {
            token: token.clone(),
            hook,
        }
    }

    /// Waits for the turn of `id`, then runs `write` on the sink and passes the turn on. The
    /// turn is passed on also if `write` fails or panics.
    pub fn write<T, F>(&self, id: SeqId, write: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> Result<T>,
    {
        let id = id.0;
        {
            let mut turn = self.gate.lock();
            while turn.next != id && !turn.interrupted {
                turn = self
                    .gate
                    .changed
                    .wait(turn)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if turn.next != id {
                return Err(PipelineError::TurnInterrupted { id }.into());
            }
        }
        let _pass = PassTurn(&self.gate);
        // only the turn holder gets here, the sink lock is uncontended.
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        write(&mut *sink)
    }

    /// Gives up the turn of `id` without writing, for a range whose processing failed. Does
    /// not block.
    pub fn skip(&self, id: SeqId) {
        let mut turn = self.gate.lock();
        if turn.next == id.0 {
            turn.advance();
            drop(turn);
            self.gate.changed.notify_all();
        } else if turn.next < id.0 {
            turn.skipped.insert(id.0);
        }
    }

    pub fn into_inner(self) -> S {
        self.sink
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
