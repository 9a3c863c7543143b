//! Shared job state: one writer (the chain thread), many readers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde_json::{json, Value};
use verdant_contracts::events::{now_utc_iso, EventWriter};
use verdant_contracts::jobs::{
    CandidateRecord, JobSnapshot, JobStatus, LogLevel, LogLine, StepResult,
};

use crate::chain::{ChainInput, EditChain};

/// Upper bound for any single pause or selection wait.
const LONGEST_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    UnknownJob(String),
    JobFinished { job_id: String, status: JobStatus },
    JobRunning(String),
    StepNotActive { requested: u32, current: u32 },
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownJob(job_id) => write!(f, "unknown job '{job_id}'"),
            Self::JobFinished { job_id, status } => {
                write!(f, "job '{job_id}' already {}", status.as_str())
            }
            Self::JobRunning(job_id) => write!(f, "job '{job_id}' is still running"),
            Self::StepNotActive { requested, current } => write!(
                f,
                "step {requested} is not awaiting a decision (current step is {current})"
            ),
        }
    }
}

impl std::error::Error for ControlError {}

/// What a blocked controller woke up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionWait {
    Selected(String),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
struct ManualSelection {
    step: u32,
    label: String,
}

#[derive(Debug, Default)]
struct Signal {
    selection: Option<ManualSelection>,
}

struct JobShared {
    id: String,
    events: EventWriter,
    out_dir: Option<PathBuf>,
    state: Mutex<JobSnapshot>,
    /// Encoded bytes of the current step's candidates, keyed by label.
    candidate_images: Mutex<IndexMap<String, Arc<[u8]>>>,
    cancelled: AtomicBool,
    signal: Mutex<Signal>,
    wake: Condvar,
}

/// Cheap, cloneable handle to a running or finished job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobShared>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl JobHandle {
    pub fn new(
        job_id: impl Into<String>,
        total_steps: u32,
        out_dir: Option<PathBuf>,
        events: Option<EventWriter>,
    ) -> Self {
        let id = job_id.into();
        let events = events.unwrap_or_else(|| EventWriter::in_memory(id.clone()));
        let snapshot = JobSnapshot {
            job_id: id.clone(),
            status: JobStatus::Running,
            progress: 0,
            total_steps,
            current_step: 0,
            current_attempt: 0,
            results: Vec::new(),
            logs: Vec::new(),
            live_candidates: Vec::new(),
            pending_selection: false,
            selected_candidate: None,
            error: None,
            final_image_path: None,
            started_at: now_utc_iso(),
            finished_at: None,
        };
        Self {
            inner: Arc::new(JobShared {
                id,
                events,
                out_dir,
                state: Mutex::new(snapshot),
                candidate_images: Mutex::new(IndexMap::new()),
                cancelled: AtomicBool::new(false),
                signal: Mutex::new(Signal::default()),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.inner.out_dir.as_deref()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.state().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    /// Encoded image of one of the current step's candidates.
    pub fn candidate_image(&self, label: &str) -> Option<Arc<[u8]>> {
        self.candidate_images()
            .get(label.trim().to_ascii_uppercase().as_str())
            .cloned()
    }

    /// Events recorded by a job without an events file.
    pub fn events(&self) -> Vec<Value> {
        self.inner.events.recorded()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Requests cancellation. Returns `false` when the job already finished.
    pub fn cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        {
            let _signal = self.signal();
            self.inner.wake.notify_all();
        }
        if first {
            let _ = self.log(LogLevel::Warning, "Cancellation requested");
        }
        true
    }

    /// Records an operator's pick for the step currently being worked on.
    ///
    /// `step == 0` targets the current step. The label is checked against the
    /// step's candidates when the controller consumes it; a later pick for
    /// the same step replaces an earlier one. `selected_candidate` only
    /// changes once the controller accepts the pick.
    pub fn select_candidate(&self, step: u32, label: &str) -> Result<u32, ControlError> {
        let step = {
            let state = self.state();
            if state.status.is_terminal() {
                return Err(ControlError::JobFinished {
                    job_id: self.inner.id.clone(),
                    status: state.status,
                });
            }
            let current = state.current_step;
            let requested = if step == 0 { current } else { step };
            let finished = state.results.iter().any(|result| result.step == requested);
            if current == 0 || requested != current || finished {
                return Err(ControlError::StepNotActive { requested, current });
            }
            requested
        };
        {
            let mut signal = self.signal();
            signal.selection = Some(ManualSelection {
                step,
                label: label.to_string(),
            });
            self.inner.wake.notify_all();
        }
        let _ = self.emit(
            "selection_received",
            json!({"step": step, "label": label}),
        );
        let _ = self.log(
            LogLevel::Info,
            format!("Manual selection received for step {step}: {label}"),
        );
        Ok(step)
    }

    pub(crate) fn take_selection(&self, step: u32) -> Option<String> {
        let mut signal = self.signal();
        match signal.selection.take() {
            Some(selection) if selection.step == step => Some(selection.label),
            Some(other) => {
                signal.selection = Some(other);
                None
            }
            None => None,
        }
    }

    /// Blocks until an operator picks a candidate for `step`, the job is
    /// cancelled, or `timeout` elapses.
    pub(crate) fn wait_for_selection(&self, step: u32, timeout: Duration) -> SelectionWait {
        let deadline = Instant::now() + timeout.min(LONGEST_WAIT);
        let mut signal = self.signal();
        loop {
            if self.is_cancelled() {
                return SelectionWait::Cancelled;
            }
            if signal
                .selection
                .as_ref()
                .is_some_and(|selection| selection.step == step)
            {
                if let Some(selection) = signal.selection.take() {
                    return SelectionWait::Selected(selection.label);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return SelectionWait::TimedOut;
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(signal, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signal = guard;
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` on
    /// cancellation.
    pub(crate) fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration.min(LONGEST_WAIT);
        let mut signal = self.signal();
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(signal, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signal = guard;
        }
    }

    pub(crate) fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        self.inner
            .events
            .emit(event_type, payload)
            .with_context(|| format!("failed writing {event_type} event"))?;
        Ok(())
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<LogLine> {
        let line = LogLine {
            ts: now_utc_iso(),
            level,
            message: message.into(),
        };
        self.state().logs.push(line.clone());
        self.emit(
            "job_log",
            json!({"level": level.as_str(), "message": line.message}),
        )?;
        Ok(line)
    }

    pub(crate) fn begin_step(&self, step: u32) {
        let mut state = self.state();
        state.current_step = step;
        state.current_attempt = 0;
        state.live_candidates.clear();
        state.pending_selection = false;
        state.selected_candidate = None;
        state.progress = progress_for(step.saturating_sub(1), state.total_steps);
        drop(state);
        self.candidate_images().clear();
        // Picks made for an earlier step never carry over.
        let mut signal = self.signal();
        if signal
            .selection
            .as_ref()
            .is_some_and(|selection| selection.step != step)
        {
            signal.selection = None;
        }
    }

    pub(crate) fn begin_attempt(&self, attempt: u32) {
        self.state().current_attempt = attempt;
    }

    pub(crate) fn push_live_candidate(&self, candidate: CandidateRecord, image: Arc<[u8]>) {
        self.candidate_images()
            .insert(candidate.label.to_ascii_uppercase(), image);
        self.state().live_candidates.push(candidate);
    }

    pub(crate) fn record_manual_pick(&self, label: &str) {
        self.state().selected_candidate = Some(label.to_string());
    }

    pub(crate) fn set_pending_selection(&self, pending: bool) {
        self.state().pending_selection = pending;
    }

    pub(crate) fn push_result(&self, result: StepResult) {
        let mut state = self.state();
        state.results.push(result);
        state.pending_selection = false;
        state.progress = progress_for(state.results.len() as u32, state.total_steps);
    }

    pub(crate) fn finish(
        &self,
        status: JobStatus,
        error: Option<String>,
        final_image: Option<&Path>,
    ) {
        {
            let mut state = self.state();
            state.status = status;
            state.error = error.clone();
            state.pending_selection = false;
            state.final_image_path =
                final_image.map(|path| path.to_string_lossy().to_string());
            state.finished_at = Some(now_utc_iso());
            if status == JobStatus::Completed {
                state.progress = 100;
            }
        }
        {
            let _signal = self.signal();
            self.inner.wake.notify_all();
        }
        let _ = self.emit(
            "job_finished",
            json!({"status": status.as_str(), "error": error}),
        );
    }

    fn state(&self) -> MutexGuard<'_, JobSnapshot> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn candidate_images(&self) -> MutexGuard<'_, IndexMap<String, Arc<[u8]>>> {
        self.inner
            .candidate_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) -> MutexGuard<'_, Signal> {
        self.inner
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn progress_for(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((f64::from(done.min(total)) / f64::from(total)) * 100.0).round() as u8
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Directory for artifacts and receipts; none keeps everything in memory.
    pub out_dir: Option<PathBuf>,
    pub events_path: Option<PathBuf>,
}

/// Registry of jobs addressable by id.
#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<Mutex<IndexMap<String, JobHandle>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, total_steps: u32, options: &JobOptions) -> JobHandle {
        let job_id = format!("job-{}", uuid::Uuid::new_v4().simple());
        let events = options
            .events_path
            .as_ref()
            .map(|path| EventWriter::new(path, job_id.clone()));
        let handle = JobHandle::new(job_id, total_steps, options.out_dir.clone(), events);
        self.jobs()
            .insert(handle.id().to_string(), handle.clone());
        handle
    }

    /// Registers a job and runs its chain on a dedicated thread.
    ///
    /// The job is observable through the store before the thread starts.
    pub fn start(
        &self,
        chain: EditChain,
        input: ChainInput,
        options: &JobOptions,
    ) -> Result<(JobHandle, JoinHandle<()>)> {
        let handle = self.create(input.steps.len() as u32, options);
        let worker = handle.clone();
        let thread_name = format!("verdant-{}", &handle.id()[..handle.id().len().min(16)]);
        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                chain.run(&worker, input);
            })
            .context("failed to spawn job thread")?;
        Ok((handle, join))
    }

    pub fn get(&self, job_id: &str) -> Option<JobHandle> {
        self.jobs().get(job_id).cloned()
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.get(job_id).map(|handle| handle.snapshot())
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.jobs().values().map(JobHandle::snapshot).collect()
    }

    pub fn cancel(&self, job_id: &str) -> Result<bool, ControlError> {
        let handle = self
            .get(job_id)
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        Ok(handle.cancel())
    }

    pub fn select_candidate(&self, job_id: &str, step: u32, label: &str) -> Result<u32, ControlError> {
        let handle = self
            .get(job_id)
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        handle.select_candidate(step, label)
    }

    /// Drops a finished job from the store. Running jobs stay put.
    pub fn remove(&self, job_id: &str) -> Result<JobSnapshot, ControlError> {
        let mut jobs = self.jobs();
        let handle = jobs
            .get(job_id)
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        let snapshot = handle.snapshot();
        if !snapshot.status.is_terminal() {
            return Err(ControlError::JobRunning(job_id.to_string()));
        }
        jobs.shift_remove(job_id);
        Ok(snapshot)
    }

    fn jobs(&self) -> MutexGuard<'_, IndexMap<String, JobHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
