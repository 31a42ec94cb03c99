use crate::api::Repository;
use crate::spec::{ChangesetTemplate, Step, TransformChanges};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::*;

/// One unit of schedulable work: a repository at a revision, the steps to
/// run against it, and the rules for turning the result into changesets.
/// Immutable after creation; only the embedded status ever changes.
///
#[derive(Debug)]
pub struct Task {
    pub repository: Repository,
    pub steps: Vec<Step>,
    pub transform: Option<TransformChanges>,
    pub template: ChangesetTemplate,

    status: Mutex<TaskStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// The progress view of one task, owned by the executor and read by the
/// status sink as snapshots.
///
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub repository: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_step: Option<usize>,
    pub step_started_at: Option<DateTime<Utc>>,
    pub step_finished_at: Option<DateTime<Utc>>,
    pub cached: bool,
    pub log_file: Option<PathBuf>,
}

impl TaskStatus {
    fn new(repository: String) -> Self {
        Self {
            repository,
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
            current_step: None,
            step_started_at: None,
            step_finished_at: None,
            cached: false,
            log_file: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Task {
    pub fn new(
        repository: Repository,
        steps: Vec<Step>,
        transform: Option<TransformChanges>,
        template: ChangesetTemplate,
    ) -> Task {
        let status = Mutex::new(TaskStatus::new(repository.name.clone()));
        Task {
            repository,
            steps,
            transform,
            template,
            status,
        }
    }

    /// A point-in-time copy of this task's status.
    pub fn status(&self) -> TaskStatus {
        self.status.lock().unwrap().clone()
    }

    pub(crate) fn transition(&self, to: TaskState) {
        let mut status = self.status.lock().unwrap();
        let allowed = matches!(
            (status.state, to),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::Cancelled)
        );
        if !allowed {
            warn!(
                "Ignoring invalid task transition {:?} -> {:?} for {}",
                status.state, to, status.repository
            );
            return;
        }

        status.state = to;
        match to {
            TaskState::Running => status.started_at = Some(Utc::now()),
            _ => status.finished_at = Some(Utc::now()),
        }
    }

    pub(crate) fn start_step(&self, index: usize) {
        let mut status = self.status.lock().unwrap();
        status.current_step = Some(index);
        status.step_started_at = Some(Utc::now());
        status.step_finished_at = None;
    }

    pub(crate) fn finish_step(&self) {
        let mut status = self.status.lock().unwrap();
        status.step_finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_cached(&self) {
        self.status.lock().unwrap().cached = true;
    }

    pub(crate) fn set_log_file(&self, path: PathBuf) {
        self.status.lock().unwrap().log_file = Some(path);
    }
}
