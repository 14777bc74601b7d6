// (c) Roel Kluin, 2023, GPL v3

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Hook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    cancelled: AtomicBool,
    hooks: Mutex<Hooks>,
}

#[derive(Default)]
struct Hooks {
    next: u64,
    list: Vec<(HookId, Hook)>,
}

/// Registration of an `on_cancel` hook, for `remove_hook`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookId(u64);

/// Cooperative stop signal shared by the workers of one pool.
///
/// Workers poll `is_cancelled` before fetching a range. Blocking waits register a hook with
/// `on_cancel` so that `cancel` wakes them instead of leaving them to a poll interval.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the flag and runs the wake hooks once. Later calls are no-ops.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut self.hooks().list);
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Runs `hook` on cancellation, or right away if already cancelled.
    pub fn on_cancel<F>(&self, hook: F) -> HookId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.hooks();
        let id = HookId(hooks.next);
        hooks.next += 1;
        // checked under the hook lock: cancel() takes the list under the same lock.
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.list.push((id, Box::new(hook)));
        }
        id
    }

    /// Unregisters a hook that has not run yet.
    pub fn remove_hook(&self, id: HookId) {
        self.hooks().list.retain(|(hook, _)| *hook != id);
    }

    /// Number of hooks waiting for cancellation.
    pub fn pending_hooks(&self) -> usize {
        self.hooks().list.len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Interrupts the wait of a pool owner. The owner stops its own workers and reports
/// `PipelineError::Interrupted`; nothing else is touched.
#[derive(Clone, Debug)]
pub struct Interrupter {
    tx: Sender<()>,
}

/// Owner side of an `Interrupter`.
#[derive(Clone, Debug)]
pub struct InterruptSignal {
    pub(crate) rx: Receiver<()>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        // full means an interrupt is already pending.
        let _ = self.tx.try_send(());
    }
}

pub fn interrupt_channel() -> (Interrupter, InterruptSignal) {
    let (tx, rx) = bounded(1);
    (Interrupter { tx }, InterruptSignal { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hooks_run_once() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!token.is_cancelled());
        token.cancel();
        token.clone().cancel();
        assert!(token.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        token.on_cancel(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn removed_hook_does_not_run() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let ids: Vec<HookId> = (0..3)
            .map(|_| {
                let c = count.clone();
                token.on_cancel(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_eq!(token.pending_hooks(), 3);
        token.remove_hook(ids[1]);
        token.remove_hook(ids[1]);
        assert_eq!(token.pending_hooks(), 2);
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(token.pending_hooks(), 0);
        token.remove_hook(ids[0]);
    }

    #[test]
    fn interrupt_is_buffered() {
        let (interrupter, signal) = interrupt_channel();
        interrupter.interrupt();
        interrupter.interrupt();
        assert!(signal.rx.try_recv().is_ok());
        assert!(signal.rx.try_recv().is_err());
    }
}
