//! The task scheduler.
//!
//! [`TaskGraph`] accepts task registrations, skips work whose persisted cache
//! token still matches, and executes the rest in dependency order on a small
//! pool of worker threads. With zero workers everything runs synchronously on
//! the joining thread, in registration order among ready tasks, which keeps
//! tests deterministic.
//!
//! ## Memoization
//!
//! Each task has an identity hash derived from its operation descriptor and
//! target paths. After a successful run the scheduler persists a token named
//! by that identity, recording a fingerprint over the operation and the
//! *content* of every input artifact. A task is skipped when its token exists,
//! the fingerprint still matches, and all targets are present on disk; a token
//! whose targets have gone missing is treated as a plain cache miss. Tokens
//! are written through a temp file and an atomic rename, one file per task
//! identity, so concurrent workers never contend on a token.
//!
//! ## Failure
//!
//! An error inside a task marks it failed and poisons every transitive
//! dependent without running it. Independent branches keep executing. Any
//! `join` that waits on a poisoned task reports the originating task plus
//! every artifact left unproduced downstream of it.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, Sender, unbounded};
use indicatif::{ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::hash::Hash32;
use crate::task::{Op, TaskState};

/// A lightweight, copyable reference to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: usize,
}

/// Execution counters for one scheduler lifetime, used to verify the
/// memoization properties from the outside.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Tasks whose callable actually ran.
    pub executed: usize,
    /// Tasks satisfied by a persisted token.
    pub cache_hits: usize,
    /// Tasks that failed or were poisoned by a failed dependency.
    pub failed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Token {
    fingerprint: String,
    label: String,
}

#[derive(Debug, Clone)]
struct Record {
    op: Op,
    targets: Vec<Utf8PathBuf>,
    identity: Hash32,
    label: String,
}

struct State {
    records: Vec<Record>,
    status: Vec<TaskState>,
    pending_deps: Vec<usize>,
    /// Edge direction: dependency -> dependent. Node weights mirror task ids.
    graph: DiGraph<usize, ()>,
    owners: HashMap<Utf8PathBuf, usize>,
    /// Root-cause errors, keyed by the task that raised them.
    origin_errors: HashMap<usize, Arc<anyhow::Error>>,
    /// For every failed task, the id of the originating failure.
    failed_origin: Vec<Option<usize>>,
    closed: bool,
    diag: Diagnostics,
}

struct Inner {
    token_dir: Utf8PathBuf,
    n_workers: usize,
    state: Mutex<State>,
    cond: Condvar,
    sender: Mutex<Option<Sender<usize>>>,
    progress: ProgressBar,
}

/// Dependency-graph scheduler with on-disk memoization.
pub struct TaskGraph {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskGraph {
    /// Create a scheduler storing cache tokens under `token_dir`. With
    /// `n_workers == 0` tasks execute synchronously inside `join`.
    pub fn new(token_dir: &Utf8Path, n_workers: usize) -> Result<Self, TaskError> {
        fs::create_dir_all(token_dir.as_std_path()).map_err(|err| TaskError::TokenDir {
            path: token_dir.to_owned(),
            message: err.to_string(),
        })?;

        let progress = ProgressBar::new(0);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );

        let (sender, receiver) = unbounded::<usize>();
        let inner = Arc::new(Inner {
            token_dir: token_dir.to_owned(),
            n_workers,
            state: Mutex::new(State {
                records: Vec::new(),
                status: Vec::new(),
                pending_deps: Vec::new(),
                graph: DiGraph::new(),
                owners: HashMap::new(),
                origin_errors: HashMap::new(),
                failed_origin: Vec::new(),
                closed: false,
                diag: Diagnostics::default(),
            }),
            cond: Condvar::new(),
            sender: Mutex::new((n_workers > 0).then_some(sender)),
            progress,
        });

        let workers = (0..n_workers)
            .map(|_| {
                let inner = inner.clone();
                let receiver: Receiver<usize> = receiver.clone();
                std::thread::spawn(move || {
                    while let Ok(id) = receiver.recv() {
                        inner.execute(id);
                    }
                })
            })
            .collect();

        Ok(Self { inner, workers })
    }

    /// Register a task. If every dependency is already complete the task is
    /// immediately eligible; a failed dependency poisons it on the spot.
    pub fn add_task(
        &self,
        op: Op,
        targets: Vec<Utf8PathBuf>,
        dependencies: &[TaskHandle],
    ) -> Result<TaskHandle, TaskError> {
        if targets.is_empty() {
            return Err(TaskError::EmptyTargets);
        }

        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(TaskError::Closed);
        }
        for target in &targets {
            if state.owners.contains_key(target) {
                return Err(TaskError::DuplicateTarget(target.clone()));
            }
        }

        let id = state.records.len();
        let identity = Hash32::combine(
            std::iter::once(op.identity()).chain(targets.iter().map(|t| Hash32::hash(t.as_str()))),
        );
        let label = format!(
            "{} -> {}",
            op.label(),
            targets[0].file_name().unwrap_or(targets[0].as_str())
        );
        debug!(task = %label, id, "registering task");

        for target in &targets {
            state.owners.insert(target.clone(), id);
        }
        state.records.push(Record {
            op,
            targets,
            identity,
            label,
        });
        state.status.push(TaskState::Pending);
        state.failed_origin.push(None);

        let node = state.graph.add_node(id);
        debug_assert_eq!(node.index(), id);

        let mut pending = 0;
        let mut poisoned_by = None;
        for dep in dependencies {
            state.graph.add_edge(NodeIndex::new(dep.id), node, ());
            match state.status[dep.id] {
                TaskState::Completed => {}
                TaskState::Failed => poisoned_by = state.failed_origin[dep.id].or(Some(dep.id)),
                _ => pending += 1,
            }
        }
        state.pending_deps.push(pending);
        self.inner.progress.inc_length(1);

        if let Some(origin) = poisoned_by {
            state.status[id] = TaskState::Failed;
            state.failed_origin[id] = Some(origin);
            state.diag.failed += 1;
            self.inner.progress.inc(1);
        } else if pending == 0 {
            self.inner.dispatch(&mut state, id);
        }

        Ok(TaskHandle { id })
    }

    /// Block until every registered task reaches a terminal state. Surfaces
    /// the first failure, if any, as a [`TaskError::Execution`].
    pub fn join(&self) -> Result<(), TaskError> {
        self.wait(None)
    }

    /// Block until the tasks producing `targets` are terminal. Each target
    /// must belong to a registered task.
    pub fn join_targets(&self, targets: &[Utf8PathBuf]) -> Result<(), TaskError> {
        let wanted = {
            let state = self.inner.state.lock().unwrap();
            let mut wanted = Vec::with_capacity(targets.len());
            for target in targets {
                match state.owners.get(target) {
                    Some(&id) => wanted.push(id),
                    None => return Err(TaskError::UnknownTarget(target.clone())),
                }
            }
            wanted
        };
        self.wait(Some(wanted))
    }

    /// Refuse further registrations. Queued tasks still run; call `join`
    /// afterwards to flush outstanding work.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        if state.status.iter().all(|s| s.is_terminal()) {
            self.inner.sender.lock().unwrap().take();
            self.inner.progress.finish_and_clear();
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.state.lock().unwrap().diag
    }

    fn wait(&self, wanted: Option<Vec<usize>>) -> Result<(), TaskError> {
        if self.inner.n_workers == 0 {
            self.inner.drive_sync(wanted.as_deref());
        }

        let mut state = self.inner.state.lock().unwrap();
        loop {
            let done = match &wanted {
                Some(ids) => ids.iter().all(|&id| state.status[id].is_terminal()),
                None => state.status.iter().all(|s| s.is_terminal()),
            };
            if done {
                break;
            }
            state = self.inner.cond.wait(state).unwrap();
        }

        let failed = match &wanted {
            Some(ids) => ids
                .iter()
                .copied()
                .find(|&id| state.status[id] == TaskState::Failed),
            None => state
                .status
                .iter()
                .position(|&s| s == TaskState::Failed),
        };

        match failed {
            None => Ok(()),
            Some(id) => {
                let origin = state.failed_origin[id].unwrap_or(id);
                let source = state
                    .origin_errors
                    .get(&origin)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(anyhow::anyhow!("dependency failed")));
                let downstream = state
                    .status
                    .iter()
                    .enumerate()
                    .filter(|&(i, &s)| {
                        s == TaskState::Failed && state.failed_origin[i].unwrap_or(i) == origin
                    })
                    .flat_map(|(i, _)| state.records[i].targets.iter())
                    .map(|t| t.to_string())
                    .collect();
                Err(TaskError::Execution {
                    label: state.records[origin].label.clone(),
                    source,
                    downstream,
                })
            }
        }
    }
}

impl Inner {
    /// Mark a ready task as scheduled and hand it to the worker pool. In
    /// synchronous mode ready tasks stay pending until the join drains them.
    fn dispatch(&self, state: &mut State, id: usize) {
        if self.n_workers == 0 {
            return;
        }
        state.status[id] = TaskState::Scheduled;
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            // A send can only fail after close(), at which point every task
            // is already terminal.
            let _ = sender.send(id);
        }
    }

    /// Synchronous driver: repeatedly run the lowest-numbered ready task
    /// until the wanted set (or everything) is terminal.
    fn drive_sync(&self, wanted: Option<&[usize]>) {
        loop {
            let next = {
                let state = self.state.lock().unwrap();
                let done = match wanted {
                    Some(ids) => ids.iter().all(|&id| state.status[id].is_terminal()),
                    None => state.status.iter().all(|s| s.is_terminal()),
                };
                if done {
                    return;
                }
                (0..state.records.len()).find(|&id| {
                    state.status[id] == TaskState::Pending && state.pending_deps[id] == 0
                })
            };
            match next {
                Some(id) => self.execute(id),
                None => return,
            }
        }
    }

    /// Run one task whose dependencies are all complete.
    fn execute(&self, id: usize) {
        let record = {
            let mut state = self.state.lock().unwrap();
            if state.status[id].is_terminal() {
                return;
            }
            state.status[id] = TaskState::Running;
            state.records[id].clone()
        };

        self.progress.set_message(record.label.clone());
        // A panicking callable must not take the worker thread down with the
        // task stuck in Running, or every join would block forever.
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.run_with_cache(&record)))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("panicked: {}", panic_text(payload.as_ref())))
                });
        self.finish(id, outcome);
    }

    /// Check the persisted token, re-executing on any mismatch. Returns
    /// whether the cached artifacts were reused.
    fn run_with_cache(&self, record: &Record) -> anyhow::Result<bool> {
        let fingerprint = self.fingerprint(record)?;
        let token_path = self
            .token_dir
            .join(format!("{}.token", record.identity.to_hex()));

        if let Ok(file) = fs::File::open(token_path.as_std_path())
            && let Ok(token) = ciborium::from_reader::<Token, _>(std::io::BufReader::new(file))
            && token.fingerprint == fingerprint.to_hex()
            && record.targets.iter().all(|t| t.exists())
        {
            debug!(task = %record.label, "cache hit");
            return Ok(true);
        }

        record.op.run(&record.targets)?;

        let token = Token {
            fingerprint: fingerprint.to_hex(),
            label: record.label.clone(),
        };
        let tmp = token_path.with_extension("token.part");
        let file = fs::File::create(tmp.as_std_path())?;
        ciborium::into_writer(&token, std::io::BufWriter::new(file))
            .map_err(|err| anyhow::anyhow!("couldn't persist cache token: {err}"))?;
        fs::rename(tmp.as_std_path(), token_path.as_std_path())?;

        Ok(false)
    }

    /// Fingerprint over the callable identity and the content of every input
    /// artifact. Inputs exist by the time this runs: dependencies completed
    /// first, and external inputs were validated at configuration time.
    fn fingerprint(&self, record: &Record) -> anyhow::Result<Hash32> {
        let mut parts = vec![record.identity];
        for input in record.op.inputs() {
            parts.push(
                Hash32::hash_file(input.as_std_path())
                    .map_err(|err| anyhow::anyhow!("couldn't hash input '{input}': {err}"))?,
            );
        }
        Ok(Hash32::combine(parts))
    }

    /// Record a task outcome, unlock its dependents or poison them, and wake
    /// all joiners.
    fn finish(&self, id: usize, outcome: anyhow::Result<bool>) {
        let mut state = self.state.lock().unwrap();
        match outcome {
            Ok(cache_hit) => {
                state.status[id] = TaskState::Completed;
                if cache_hit {
                    state.diag.cache_hits += 1;
                } else {
                    state.diag.executed += 1;
                }

                let dependents: Vec<usize> = state
                    .graph
                    .neighbors_directed(NodeIndex::new(id), Direction::Outgoing)
                    .map(|n| state.graph[n])
                    .collect();
                for dep in dependents {
                    state.pending_deps[dep] -= 1;
                    if state.pending_deps[dep] == 0 && state.status[dep] == TaskState::Pending {
                        self.dispatch(&mut state, dep);
                    }
                }
            }
            Err(err) => {
                warn!(task = %state.records[id].label, error = %err, "task failed");
                state.origin_errors.insert(id, Arc::new(err));
                self.poison(&mut state, id, id);
            }
        }

        self.progress.inc(1);
        if state.closed && state.status.iter().all(|s| s.is_terminal()) {
            self.sender.lock().unwrap().take();
            self.progress.finish_and_clear();
        }
        self.cond.notify_all();
    }

    /// Mark `id` and every transitive dependent failed without running them.
    fn poison(&self, state: &mut State, id: usize, origin: usize) {
        if state.status[id] == TaskState::Failed {
            return;
        }
        state.status[id] = TaskState::Failed;
        state.failed_origin[id] = Some(origin);
        state.diag.failed += 1;

        let dependents: Vec<usize> = state
            .graph
            .neighbors_directed(NodeIndex::new(id), Direction::Outgoing)
            .map(|n| state.graph[n])
            .collect();
        for dep in dependents {
            self.poison(state, dep, origin);
        }
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "non-string panic payload"
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.close();
        // Disconnect workers even if the caller never joined.
        self.inner.sender.lock().unwrap().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
