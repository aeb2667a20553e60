//! Chained parallel pipelines.
//!
//! A [`Chain`] runs every element of an input sequence through an ordered
//! list of stages — transforms, filters, process-pool jobs — with each
//! stage's elementwise work executed in parallel up to that stage's width.
//! Output order always equals input order, whatever the completion order.
//!
//! ```no_run
//! use strand::chain::Chain;
//!
//! let results = Chain::<i32, i32>::new()
//!     .map(|n| n * 10)
//!     .map(|n| n.to_string())
//!     .filter(|s| !s.ends_with("00"))
//!     .execute_eager(vec![1, 2, 3, 4, 5])
//!     .unwrap();
//! ```
//!
//! Each run is independent: stages get fresh pools, and nothing is shared
//! between runs. Failures abort the whole run — outstanding work is
//! cancelled best-effort and the first error *by input position* is the one
//! returned.

pub(crate) mod engine;

use crate::error::{Error, Result};
use crate::executor::handle::TaskHandle;
use crate::executor::{process_worker, ThreadPool};
use crossbeam_channel::Receiver;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(crate) type BoxedItem = Box<dyn Any + Send>;

pub(crate) enum StageVerdict {
    Keep(BoxedItem),
    Discard,
}

type StageRun =
    Arc<dyn Fn(&ThreadPool, BoxedItem) -> Result<TaskHandle<StageVerdict>> + Send + Sync>;
type StageSeq = Arc<dyn Fn(BoxedItem) -> Result<StageVerdict> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct StageSpec {
    pub(crate) label: &'static str,
    pub(crate) width: Option<usize>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) run: StageRun,
    pub(crate) run_seq: StageSeq,
}

/// Per-stage tuning: concurrency width and a per-element deadline.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// In-flight elements at once; `None` means one per CPU.
    pub width: Option<usize>,
    /// Per-element deadline; exceeding it aborts the run with
    /// [`Error::Timeout`].
    pub timeout: Option<Duration>,
}

impl StageOptions {
    pub fn width(width: usize) -> Self {
        StageOptions {
            width: Some(width),
            timeout: None,
        }
    }
}

fn downcast<T: 'static>(item: BoxedItem) -> T {
    *item
        .downcast::<T>()
        .expect("chain stage received an item of the wrong type")
}

/// An immutable pipeline description from `In` elements to `Out` elements.
/// Building is cheap; nothing runs until one of the `execute_*` methods is
/// called.
pub struct Chain<In, Out> {
    stages: Vec<StageSpec>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In: Send + 'static> Chain<In, In> {
    /// A chain with no stages: the identity pipeline.
    pub fn new() -> Self {
        Chain {
            stages: Vec::new(),
            _types: PhantomData,
        }
    }
}

impl<In: Send + 'static> Default for Chain<In, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> Chain<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn push<R>(mut self, stage: StageSpec) -> Chain<In, R> {
        self.stages.push(stage);
        Chain {
            stages: self.stages,
            _types: PhantomData,
        }
    }

    /// Append a parallel transform stage with default options.
    pub fn map<R, F>(self, f: F) -> Chain<In, R>
    where
        R: Send + 'static,
        F: Fn(Out) -> R + Send + Sync + 'static,
    {
        self.map_opts(f, StageOptions::default())
    }

    pub fn map_opts<R, F>(self, f: F, opts: StageOptions) -> Chain<In, R>
    where
        R: Send + 'static,
        F: Fn(Out) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let f_seq = Arc::clone(&f);
        let run: StageRun = Arc::new(move |pool, item| {
            let input = downcast::<Out>(item);
            let f = Arc::clone(&f);
            pool.submit_fallible(move || Ok(StageVerdict::Keep(Box::new(f(input)))))
        });
        let run_seq: StageSeq =
            Arc::new(move |item| Ok(StageVerdict::Keep(Box::new(f_seq(downcast::<Out>(item))))));
        self.push(StageSpec {
            label: "map",
            width: opts.width,
            timeout: opts.timeout,
            run,
            run_seq,
        })
    }

    /// Append a fallible transform stage; an `Err` aborts the run at that
    /// element's position.
    pub fn try_map<R, F>(self, f: F) -> Chain<In, R>
    where
        R: Send + 'static,
        F: Fn(Out) -> Result<R> + Send + Sync + 'static,
    {
        self.try_map_opts(f, StageOptions::default())
    }

    pub fn try_map_opts<R, F>(self, f: F, opts: StageOptions) -> Chain<In, R>
    where
        R: Send + 'static,
        F: Fn(Out) -> Result<R> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let f_seq = Arc::clone(&f);
        let run: StageRun = Arc::new(move |pool, item| {
            let input = downcast::<Out>(item);
            let f = Arc::clone(&f);
            pool.submit_fallible(move || {
                f(input).map(|value| StageVerdict::Keep(Box::new(value) as BoxedItem))
            })
        });
        let run_seq: StageSeq = Arc::new(move |item| {
            f_seq(downcast::<Out>(item)).map(|value| StageVerdict::Keep(Box::new(value) as BoxedItem))
        });
        self.push(StageSpec {
            label: "try_map",
            width: opts.width,
            timeout: opts.timeout,
            run,
            run_seq,
        })
    }

    /// Append a parallel predicate stage. Discarded elements drop out of
    /// the sequence; remaining elements keep their original positions for
    /// ordering purposes. A panicking predicate counts as a work failure at
    /// that position.
    pub fn filter<F>(self, pred: F) -> Chain<In, Out>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        self.filter_opts(pred, StageOptions::default())
    }

    pub fn filter_opts<F>(self, pred: F, opts: StageOptions) -> Chain<In, Out>
    where
        F: Fn(&Out) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        let pred_seq = Arc::clone(&pred);
        let run: StageRun = Arc::new(move |pool, item| {
            let input = downcast::<Out>(item);
            let pred = Arc::clone(&pred);
            pool.submit_fallible(move || {
                Ok(if pred(&input) {
                    StageVerdict::Keep(Box::new(input))
                } else {
                    StageVerdict::Discard
                })
            })
        });
        let run_seq: StageSeq = Arc::new(move |item| {
            let input = downcast::<Out>(item);
            Ok(if pred_seq(&input) {
                StageVerdict::Keep(Box::new(input))
            } else {
                StageVerdict::Discard
            })
        });
        self.push(StageSpec {
            label: "filter",
            width: opts.width,
            timeout: opts.timeout,
            run,
            run_seq,
        })
    }

    /// Run the ordered chain output through a left fold.
    pub fn reduce<I, F>(&self, input: I, f: F) -> Result<Option<Out>>
    where
        I: IntoIterator<Item = In>,
        F: Fn(Out, Out) -> Out,
    {
        Ok(self.execute_eager(input)?.into_iter().reduce(f))
    }

    /// Run the chain over `input`, collecting the full ordered output.
    pub fn execute_eager<I>(&self, input: I) -> Result<Vec<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let source = input.into_iter().map(|item| Box::new(item) as BoxedItem);
        engine::run(self.stages.clone(), source, &tx);
        drop(tx);

        let mut out = Vec::new();
        for result in rx.try_iter() {
            out.push(downcast::<Out>(result?));
        }
        Ok(out)
    }

    /// Run the chain over `input` on a background driver, yielding ordered
    /// results as they become releasable. Dropping the iterator aborts the
    /// run.
    pub fn execute_lazy<I>(&self, input: I) -> ChainIter<Out>
    where
        I: IntoIterator<Item = In>,
        I::IntoIter: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let stages = self.stages.clone();
        let iter = input.into_iter();

        let spawned = thread::Builder::new()
            .name("strand-chain-driver".to_string())
            .spawn(move || {
                let source = iter.map(|item| Box::new(item) as BoxedItem);
                engine::run(stages, source, &tx);
            });
        if let Err(e) = spawned {
            let (err_tx, err_rx) = crossbeam_channel::bounded(1);
            let _ = err_tx.send(Err(Error::config(format!("spawn failed: {}", e))));
            return ChainIter {
                rx: err_rx,
                done: false,
                _marker: PhantomData,
            };
        }

        ChainIter {
            rx,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Run the chain in the calling thread, one element at a time, with no
    /// workers involved. Meant for testing a chain's logic in isolation.
    pub fn execute_seq<I>(&self, input: I) -> SeqIter<I::IntoIter, Out>
    where
        I: IntoIterator<Item = In>,
    {
        SeqIter {
            input: input.into_iter(),
            stages: self.stages.clone(),
            done: false,
            _marker: PhantomData,
        }
    }

    /// Eager companion of [`Chain::execute_seq`].
    pub fn collect_seq<I>(&self, input: I) -> Result<Vec<Out>>
    where
        I: IntoIterator<Item = In>,
    {
        self.execute_seq(input).collect()
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }
}

impl<In, Out> Chain<In, Out>
where
    In: Send + 'static,
    Out: Serialize + Send + 'static,
{
    /// Append a stage that runs each element through the named job on the
    /// runtime's default process pool. The element is serialized at
    /// submission time; failure to serialize aborts the run with
    /// [`Error::Unserializable`] before any worker sees it.
    pub fn map_process<R>(self, job: &str) -> Chain<In, R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.map_process_opts(job, StageOptions::default())
    }

    pub fn map_process_opts<R>(self, job: &str, opts: StageOptions) -> Chain<In, R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let job = job.to_string();
        let job_seq = job.clone();

        let run: StageRun = Arc::new(move |pool, item| {
            let input = downcast::<Out>(item);
            let payload =
                serde_json::to_value(&input).map_err(|e| Error::unserializable(e.to_string()))?;
            // resolved on the driver thread, where the runtime is visible
            let process_pool = crate::runtime::default_process_pool()?;
            let job = job.clone();
            pool.submit_fallible(move || {
                let handle = process_pool.submit_value(&job, payload)?;
                let value = handle.result(None)?;
                serde_json::from_value::<R>(value)
                    .map(|v| StageVerdict::Keep(Box::new(v) as BoxedItem))
                    .map_err(|e| Error::unserializable(e.to_string()))
            })
        });

        // Sequential mode executes the job in-process; it must be
        // registered in the calling process.
        let run_seq: StageSeq = Arc::new(move |item| {
            let input = downcast::<Out>(item);
            let payload =
                serde_json::to_value(&input).map_err(|e| Error::unserializable(e.to_string()))?;
            match process_worker::run_local(&job_seq, payload) {
                process_worker::WireOutcome::Ok(value) => serde_json::from_value::<R>(value)
                    .map(|v| StageVerdict::Keep(Box::new(v) as BoxedItem))
                    .map_err(|e| Error::unserializable(e.to_string())),
                process_worker::WireOutcome::Err(msg) => Err(Error::work_message(msg)),
                process_worker::WireOutcome::UnknownJob(name) => Err(Error::UnknownJob(name)),
                process_worker::WireOutcome::Panic(msg) => Err(Error::Panic(msg)),
            }
        });

        self.push(StageSpec {
            label: "map_process",
            width: opts.width,
            timeout: opts.timeout,
            run,
            run_seq,
        })
    }
}

impl<In, Out> std::fmt::Debug for Chain<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.label).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Ordered lazy output of a chain run. Yields `Err` once at most; the run
/// is aborted when the iterator is dropped early.
pub struct ChainIter<Out> {
    rx: Receiver<Result<BoxedItem>>,
    done: bool,
    _marker: PhantomData<fn() -> Out>,
}

impl<Out: Send + 'static> Iterator for ChainIter<Out> {
    type Item = Result<Out>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(item)) => Some(Ok(downcast::<Out>(item))),
            Ok(Err(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl<Out> std::fmt::Debug for ChainIter<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainIter").field("done", &self.done).finish()
    }
}

/// Single-threaded chain execution, element by element.
pub struct SeqIter<I, Out> {
    input: I,
    stages: Vec<StageSpec>,
    done: bool,
    _marker: PhantomData<fn() -> Out>,
}

impl<I, Out> Iterator for SeqIter<I, Out>
where
    I: Iterator,
    I::Item: Send + 'static,
    Out: Send + 'static,
{
    type Item = Result<Out>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        'input: loop {
            let item = self.input.next()?;
            let mut current: BoxedItem = Box::new(item);
            for stage in &self.stages {
                match (stage.run_seq)(current) {
                    Ok(StageVerdict::Keep(next)) => current = next,
                    Ok(StageVerdict::Discard) => continue 'input,
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }
            return Some(Ok(downcast::<Out>(current)));
        }
    }
}

impl<I, Out> std::fmt::Debug for SeqIter<I, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqIter")
            .field("stages", &self.stages.len())
            .field("done", &self.done)
            .finish()
    }
}
