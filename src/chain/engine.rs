//! The chain run driver.
//!
//! One driver owns a run: per stage it keeps a sliding window of at most
//! `width` in-flight task handles keyed by input position, refilling each
//! slot the moment it frees. Completion callbacks post `(stage, position)`
//! events into the driver's channel; the driver routes finished elements to
//! the next stage's ready set and releases final results in strictly
//! increasing position order.

use super::{BoxedItem, StageSpec, StageVerdict};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::handle::TaskHandle;
use crate::executor::ThreadPool;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

struct InflightTask {
    handle: TaskHandle<StageVerdict>,
    deadline: Option<Instant>,
}

struct StageRt {
    pool: ThreadPool,
    width: usize,
    spec: StageSpec,
    /// Completed output of the previous stage awaiting a free slot here.
    ready: BTreeMap<u64, BoxedItem>,
    inflight: HashMap<u64, InflightTask>,
}

enum Step {
    Continue,
    Finished,
    ConsumerGone,
    Failed(u64, Error),
}

/// Drive the whole run. Results and at most one error go through `sink`;
/// a closed sink aborts the run.
pub(crate) fn run(
    stages: Vec<StageSpec>,
    source: impl Iterator<Item = BoxedItem>,
    sink: &Sender<Result<BoxedItem>>,
) {
    // zero stages: the identity pipeline
    if stages.is_empty() {
        for item in source {
            if sink.send(Ok(item)).is_err() {
                return;
            }
        }
        return;
    }

    let mut source = source.peekable();
    if source.peek().is_none() {
        // empty input: no pools, no submissions
        return;
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded();

    let mut rts = Vec::with_capacity(stages.len());
    for (index, spec) in stages.into_iter().enumerate() {
        let width = spec.width.unwrap_or_else(num_cpus::get).max(1);
        let pool = match stage_pool(index, width) {
            Ok(pool) => pool,
            Err(err) => {
                let _ = sink.send(Err(err));
                return;
            }
        };
        rts.push(StageRt {
            pool,
            width,
            spec,
            ready: BTreeMap::new(),
            inflight: HashMap::new(),
        });
    }

    let mut engine = Engine {
        rts,
        source,
        source_done: false,
        next_pos: 0,
        resolved: BTreeMap::new(),
        next_emit: 0,
        events_tx,
        events_rx,
        sink,
    };

    tracing::debug!(stages = engine.rts.len(), "chain run started");

    loop {
        match engine.step() {
            Step::Continue => {}
            Step::Finished => {
                tracing::debug!(emitted = engine.next_emit, "chain run finished");
                return;
            }
            Step::ConsumerGone => {
                engine.abort();
                return;
            }
            Step::Failed(pos, err) => {
                let err = engine.drain_failure(pos, err);
                let _ = engine.sink.send(Err(err));
                engine.abort();
                return;
            }
        }
    }
}

fn stage_pool(index: usize, width: usize) -> Result<ThreadPool> {
    let config = Config::builder()
        .thread_width(width)
        .thread_name_prefix(format!("strand-chain{}", index))
        .build()?;
    ThreadPool::new(&config)
}

struct Engine<'a, S> {
    rts: Vec<StageRt>,
    source: S,
    source_done: bool,
    next_pos: u64,
    /// Final-stage outcomes buffered by position; `None` marks a discarded
    /// position, released as a gap.
    resolved: BTreeMap<u64, Option<BoxedItem>>,
    next_emit: u64,
    events_tx: Sender<(usize, u64)>,
    events_rx: Receiver<(usize, u64)>,
    sink: &'a Sender<Result<BoxedItem>>,
}

impl<'a, S: Iterator<Item = BoxedItem>> Engine<'a, S> {
    fn step(&mut self) -> Step {
        // feed stage 0 from the source up to its window
        while !self.source_done
            && self.rts[0].ready.len() + self.rts[0].inflight.len() < self.rts[0].width
        {
            match self.source.next() {
                Some(item) => {
                    self.rts[0].ready.insert(self.next_pos, item);
                    self.next_pos += 1;
                }
                None => self.source_done = true,
            }
        }

        // fill every free slot, lowest position first
        for i in 0..self.rts.len() {
            while self.rts[i].inflight.len() < self.rts[i].width {
                let Some((pos, item)) = self.rts[i].ready.pop_first() else {
                    break;
                };
                if let Err(err) = self.submit(i, pos, item) {
                    return Step::Failed(pos, err);
                }
            }
        }

        if self.source_done
            && self
                .rts
                .iter()
                .all(|s| s.ready.is_empty() && s.inflight.is_empty())
        {
            return Step::Finished;
        }

        match self.wait_event() {
            Some((stage, pos)) => self.handle_event(stage, pos),
            None => self.handle_deadline(),
        }
    }

    fn submit(&mut self, stage: usize, pos: u64, item: BoxedItem) -> Result<()> {
        let rt = &self.rts[stage];
        let deadline = rt.spec.timeout.map(|t| Instant::now() + t);
        let handle = (rt.spec.run)(&rt.pool, item)?;

        let events = self.events_tx.clone();
        handle.add_done_callback(move |_| {
            // the receiver is gone when the run was aborted
            let _ = events.send((stage, pos));
        });

        self.rts[stage]
            .inflight
            .insert(pos, InflightTask { handle, deadline });
        Ok(())
    }

    /// Block for the next completion event, bounded by the nearest
    /// per-element deadline. `None` means a deadline elapsed.
    fn wait_event(&self) -> Option<(usize, u64)> {
        // queued completions beat deadline checks, or an already-finished
        // task could be misread as overdue forever
        if let Ok(event) = self.events_rx.try_recv() {
            return Some(event);
        }

        let nearest = self
            .rts
            .iter()
            .flat_map(|s| s.inflight.values().filter_map(|t| t.deadline))
            .min();

        match nearest {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return None;
                }
                match self.events_rx.recv_timeout(deadline - now) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            }
            // a sender is always held here, and some work is in flight
            None => self.events_rx.recv().ok(),
        }
    }

    fn handle_event(&mut self, stage: usize, pos: u64) -> Step {
        let Some(inflight) = self.rts[stage].inflight.remove(&pos) else {
            return Step::Continue;
        };

        match inflight.handle.take_outcome() {
            Ok(StageVerdict::Keep(item)) => {
                if stage + 1 < self.rts.len() {
                    self.rts[stage + 1].ready.insert(pos, item);
                    Step::Continue
                } else {
                    self.resolved.insert(pos, Some(item));
                    self.release_ready()
                }
            }
            Ok(StageVerdict::Discard) => {
                self.resolved.insert(pos, None);
                self.release_ready()
            }
            Err(err) => Step::Failed(pos, err),
        }
    }

    fn handle_deadline(&mut self) -> Step {
        let now = Instant::now();
        let mut overdue: Option<(usize, u64)> = None;
        for (i, rt) in self.rts.iter().enumerate() {
            for (&pos, task) in &rt.inflight {
                if matches!(task.deadline, Some(d) if d <= now)
                    && !task.handle.is_done()
                    && overdue.map_or(true, |(_, p)| pos < p)
                {
                    overdue = Some((i, pos));
                }
            }
        }

        match overdue {
            Some((stage, pos)) => {
                if let Some(task) = self.rts[stage].inflight.remove(&pos) {
                    task.handle.cancel();
                }
                Step::Failed(pos, Error::Timeout)
            }
            None => Step::Continue,
        }
    }

    /// Release buffered final results in strictly increasing position
    /// order; discarded positions pass as gaps.
    fn release_ready(&mut self) -> Step {
        while let Some((&pos, _)) = self.resolved.first_key_value() {
            if pos != self.next_emit {
                break;
            }
            let (_, value) = self.resolved.pop_first().expect("first entry present");
            self.next_emit += 1;
            if let Some(item) = value {
                if self.sink.send(Ok(item)).is_err() {
                    return Step::ConsumerGone;
                }
            }
        }
        Step::Continue
    }

    /// Fail-fast: cancel everything outstanding, then wait only for
    /// in-flight work at positions below the failing one — a later failure
    /// there takes precedence, since errors surface by input order.
    fn drain_failure(&mut self, pos: u64, err: Error) -> Error {
        let mut min_pos = pos;
        let mut min_err = err;

        for rt in &self.rts {
            for task in rt.inflight.values() {
                task.handle.cancel();
            }
        }
        for rt in &mut self.rts {
            rt.ready.clear();
        }

        loop {
            let waiting = self
                .rts
                .iter()
                .flat_map(|s| s.inflight.keys())
                .any(|&p| p < min_pos);
            if !waiting {
                break;
            }
            let Ok((stage, event_pos)) = self.events_rx.recv() else {
                break;
            };
            let Some(task) = self.rts[stage].inflight.remove(&event_pos) else {
                continue;
            };
            if event_pos < min_pos {
                match task.handle.take_outcome() {
                    // our own cancellation, not a failure of the element
                    Err(Error::Cancelled) => {}
                    Err(other) => {
                        min_pos = event_pos;
                        min_err = other;
                    }
                    Ok(_) => {}
                }
            }
        }

        tracing::debug!(position = min_pos, error = %min_err, "chain run failed");
        min_err
    }

    /// Detach cleanup so an abort returns promptly even while uncancellable
    /// work is still running on stage pools.
    fn abort(&mut self) {
        let rts = std::mem::take(&mut self.rts);
        if rts
            .iter()
            .all(|s| s.inflight.is_empty() && s.pool.pending_tasks() == 0)
        {
            // nothing running; drop inline
            return;
        }
        let _ = std::thread::Builder::new()
            .name("strand-chain-reaper".to_string())
            .spawn(move || drop(rts));
    }
}
