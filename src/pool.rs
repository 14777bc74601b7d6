// (c) Roel Kluin, 2023, GPL v3

use crate::cancel::{interrupt_channel, CancelToken, InterruptSignal, Interrupter};
use crate::dispatch::{Dispatch, SeqId, WorkRange};
use crate::error::{PipelineError, WorkerFailure};
use crate::ordered::OrderedSink;
use anyhow::{anyhow, Result};
use clap::{ArgAction, Args};
use crossbeam_channel::{never, select, unbounded, Sender};
use log::{debug, warn};
use std::any::Any;
use std::thread;

fn default_threads() -> usize {
    thread::available_parallelism().map_or(4, usize::from)
}

/// Sizing of a worker pool and of the ranges it is fed.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads
    #[arg(short = 't', long, default_value_t = default_threads())]
    pub threads: usize,

    /// Bytes per range handed to a worker
    #[arg(long, value_name = "BYTES", default_value_t = 1 << 20)]
    pub range_bytes: usize,

    /// Records per range handed to a worker
    #[arg(long, value_name = "N", default_value_t = 1024)]
    pub range_records: usize,

    /// Let the other workers continue after one fails
    #[arg(long = "keep-going", action = ArgAction::SetFalse)]
    pub abort_on_failure: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            threads: default_threads(),
            range_bytes: 1 << 20,
            range_records: 1024,
            abort_on_failure: true,
        }
    }
}

impl PoolConfig {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    pub fn range_bytes(mut self, range_bytes: usize) -> Self {
        self.range_bytes = range_bytes;
        self
    }
    pub fn range_records(mut self, range_records: usize) -> Self {
        self.range_records = range_records;
        self
    }
    pub fn abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }
}

/// Per worker processing step.
pub trait Worker<R> {
    fn process(&mut self, range: WorkRange<R>) -> Result<()>;
}

impl<R, F> Worker<R> for F
where
    F: FnMut(WorkRange<R>) -> Result<()>,
{
    fn process(&mut self, range: WorkRange<R>) -> Result<()> {
        self(range)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub workers: usize,
    /// Ranges processed without error.
    pub ranges: u64,
    /// The pool was cancelled and stopped before the source ran out.
    pub cancelled: bool,
}

/// Sends the worker index to the owner when dropped, so a worker signals completion exactly
/// once, whether it returns or panics.
struct Completion<'a> {
    worker: usize,
    done: Sender<usize>,
    token: &'a CancelToken,
    abort_on_panic: bool,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if thread::panicking() && self.abort_on_panic {
            self.token.cancel();
        }
        let _ = self.done.send(self.worker);
    }
}

/// Gives up the turn of a range whose worker panics before its write is done. After the write
/// the turn has already passed and `skip` does nothing.
struct HeldTurn<'a, S> {
    sink: &'a OrderedSink<S>,
    id: SeqId,
}

impl<S> Drop for HeldTurn<'_, S> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.sink.skip(self.id);
        }
    }
}

/// A fixed number of named threads that drain one dispatcher.
///
/// The pool owns a `CancelToken`. Cancelling it lets every worker finish its current range and
/// stop; that is a normal end of the run, reported by `RunSummary::cancelled`. Interrupting the
/// owner through an `Interrupter` cancels the same token and fails the run with
/// `PipelineError::Interrupted` once all workers have stopped.
pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    token: CancelToken,
    signal: Option<InterruptSignal>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        WorkerPool {
            name: name.into(),
            config,
            token: CancelToken::new(),
            signal: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn threads(&self) -> usize {
        self.config.threads.max(1)
    }

    /// The cancellation token of this pool's workers. A cancelled pool stays cancelled.
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Handle to interrupt the owner's wait in `run`.
    pub fn interrupter(&mut self) -> Interrupter {
        let (interrupter, signal) = interrupt_channel();
        self.signal = Some(signal);
        interrupter
    }

    /// Runs `threads` workers, made by `make_worker(index)`, until `dispatcher` is exhausted,
    /// the pool is cancelled or the owner is interrupted. Worker errors are collected and
    /// reported together after all workers stopped.
    pub fn run<D, F, W>(&self, dispatcher: &D, mut make_worker: F) -> Result<RunSummary, PipelineError>
    where
        D: Dispatch,
        F: FnMut(usize) -> W,
        W: Worker<D::Range> + Send,
    {
        let total = self.threads();
        let abort = self.config.abort_on_failure;
        let token = &self.token;
        debug!("{}: starting {} workers", self.name, total);

        let (done_tx, done_rx) = unbounded::<usize>();
        let interrupts = match &self.signal {
            Some(signal) => signal.rx.clone(),
            None => never(),
        };

        thread::scope(|s| {
            let mut handles = Vec::with_capacity(total);
            let mut spawn_error = None;
            for i in 0..total {
                let mut worker = make_worker(i);
                let done = done_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", self.name, i))
                    .spawn_scoped(s, move || {
                        let _completion = Completion {
                            worker: i,
                            done,
                            token,
                            abort_on_panic: abort,
                        };
                        let (ranges, res) = drain(dispatcher, &mut worker, token);
                        if let Err(e) = &res {
                            if abort && !is_turn_interrupted(e) {
                                warn!("worker {i} failed, cancelling the others: {e:#}");
                                token.cancel();
                            }
                        }
                        (ranges, res)
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        token.cancel();
                        spawn_error = Some(PipelineError::Spawn { worker: i, source });
                        break;
                    }
                }
            }
            drop(done_tx);

            let spawned = handles.len();
            let mut finished = 0;
            let mut interrupted_at = None;
            let mut listening = true;
            while finished < spawned {
                let done = if listening {
                    select! {
                        recv(done_rx) -> msg => Some(msg),
                        recv(interrupts) -> signal => {
                            // a dropped interrupter can no longer interrupt
                            listening = false;
                            if signal.is_ok() {
                                warn!("{}: interrupted, stopping {} workers", self.name, spawned - finished);
                                interrupted_at = Some(finished);
                                token.cancel();
                            }
                            None
                        },
                    }
                } else {
                    Some(done_rx.recv())
                };
                match done {
                    Some(Ok(worker)) => {
                        finished += 1;
                        debug!("{}: worker {} done, {} of {}", self.name, worker, finished, spawned);
                    }
                    Some(Err(_)) => break,
                    None => {}
                }
            }

            let mut ranges = 0;
            let mut failures = Vec::new();
            for (worker, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok((n, res)) => {
                        ranges += n;
                        match res {
                            Ok(()) => {}
                            Err(error) if token.is_cancelled() && is_turn_interrupted(&error) => {}
                            Err(error) => failures.push(WorkerFailure { worker, error }),
                        }
                    }
                    Err(payload) => failures.push(WorkerFailure {
                        worker,
                        error: anyhow!("panicked: {}", panic_message(&*payload)),
                    }),
                }
            }
            debug!("{}: {} ranges processed", self.name, ranges);

            if let Some(finished) = interrupted_at {
                for failure in &failures {
                    warn!("{}: {} before the interrupt", self.name, failure);
                }
                return Err(PipelineError::Interrupted {
                    finished,
                    total,
                    failures,
                });
            }
            if let Some(e) = spawn_error {
                return Err(e);
            }
            if !failures.is_empty() {
                return Err(PipelineError::WorkersFailed { failures, total });
            }
            let cancelled = token.is_cancelled();
            if cancelled {
                warn!("{}: cancelled after {} of {} ranges", self.name, ranges, dispatcher.dispatched());
            }
            Ok(RunSummary {
                workers: total,
                ranges,
                cancelled,
            })
        })
    }

    /// As `run`, with the output of each range written to `sink` in range order. `make_worker`
    /// makes the per-worker processing step and `emit` writes one result to the sink.
    ///
    /// A range whose processing fails or panics gives up its turn, so later ranges are not held
    /// up by it.
    pub fn run_ordered<D, S, O, F, P, E>(
        &self,
        dispatcher: &D,
        sink: &OrderedSink<S>,
        mut make_worker: F,
        emit: E,
    ) -> Result<RunSummary, PipelineError>
    where
        D: Dispatch,
        S: Send,
        F: FnMut(usize) -> P,
        P: FnMut(D::Range) -> Result<O> + Send,
        E: Fn(&mut S, O) -> Result<()> + Sync,
    {
        let _watch = sink.watch(&self.token);
        let emit = &emit;
        self.run(dispatcher, |i| {
            let mut process = make_worker(i);
            move |range: WorkRange<D::Range>| -> Result<()> {
                let id = range.id;
                let _held = HeldTurn { sink, id };
                match process(range.data) {
                    Ok(out) => sink.write(id, |s| emit(s, out)),
                    Err(e) => {
                        sink.skip(id);
                        Err(e.context(format!("range {id}")))
                    }
                }
            }
        })
    }
}

/// Feeds ranges to `worker` until the source ends, the token is cancelled or an error occurs.
/// Returns the number of ranges processed, also when it stopped on an error.
fn drain<D, W>(dispatcher: &D, worker: &mut W, token: &CancelToken) -> (u64, Result<()>)
where
    D: Dispatch,
    W: Worker<D::Range>,
{
    let mut ranges = 0;
    while !token.is_cancelled() {
        let range = match dispatcher.next_range() {
            Ok(Some(range)) => range,
            Ok(None) => break,
            Err(e) => return (ranges, Err(e)),
        };
        if let Err(e) = worker.process(range) {
            return (ranges, Err(e));
        }
        ranges += 1;
    }
    (ranges, Ok(()))
}

fn is_turn_interrupted(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<PipelineError>(),
        Some(PipelineError::TurnInterrupted { .. })
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown cause".to_string()
    }
}
