use super::cache::{ExecutionCache, ExecutionResult};
use super::diff::{self, DiffError};
use super::fingerprint::{ExecutionCacheKey, FingerprintError};
use super::step_runner::{StepError, StepRunner};
use super::task::{Task, TaskState, TaskStatus};
use super::template::{self, Environment, StepSnapshot, TemplateError};
use crate::api::{ensure_refs_heads, ChangesetSpec, GitCommitDescription, Repository};
use crate::archive::{RepoFetcher, RepoFetcherError};
use crate::container::{ContainerError, ContainerRuntime};
use crate::events::{Event, EventChannel};
use crate::spec::{ChangesetTemplate, Step, TransformChanges};
use crate::workspace::{WorkspaceCreator, WorkspaceError};
use crossbeam::deque::{Injector, Steal};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::*;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Used when the changeset template has no commit author.
const DEFAULT_AUTHOR_NAME: &str = "Campaigner";
const DEFAULT_AUTHOR_EMAIL: &str = "campaigner@example.com";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Could not resolve image {image:?}: {err}")]
    ImageResolution {
        image: String,
        #[source]
        err: ContainerError,
    },
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Fetching archive for {repository} failed: {err}")]
    Fetch {
        repository: String,
        #[source]
        err: RepoFetcherError,
    },

    #[error("Creating workspace for {repository} failed: {err}")]
    Workspace {
        repository: String,
        #[source]
        err: WorkspaceError,
    },

    #[error("Step {step} in {repository} failed: {err}")]
    Step {
        repository: String,
        step: usize,
        #[source]
        err: StepError,
    },

    #[error("Evaluating templates for {repository} failed: {err}")]
    Template {
        repository: String,
        #[source]
        err: TemplateError,
    },

    #[error("Computing the diff for {repository} failed: {err}")]
    Diff {
        repository: String,
        #[source]
        err: DiffError,
    },

    #[error("Fingerprinting the task for {repository} failed: {err}")]
    Fingerprint {
        repository: String,
        #[source]
        err: FingerprintError,
    },

    #[error("Could not open a log file for {repository}: {err}")]
    Log {
        repository: String,
        err: std::io::Error,
    },

    #[error("Task for {repository} hit the {timeout:?} timeout")]
    Timeout {
        repository: String,
        timeout: Duration,
    },

    #[error("Task for {repository} was cancelled")]
    Cancelled { repository: String },

    #[error("A worker crashed: {detail}")]
    Worker { detail: String },
}

/// Every task failure of one run, in completion order. Tasks that
/// succeeded still contributed their specs.
///
#[derive(Debug, Default)]
pub struct TaskErrors(pub Vec<TaskError>);

impl TaskErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} tasks failed:", self.0.len())?;
        for err in &self.0 {
            writeln!(f, "  * {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskErrors {}

#[derive(Debug, Clone)]
pub struct ExecutorOpts {
    pub cache: Arc<dyn ExecutionCache>,
    pub clear_cache: bool,
    pub keep_logs: bool,
    pub timeout: Duration,
    pub temp_dir: PathBuf,

    /// Worker count; 0 means one per CPU.
    pub parallelism: usize,

    pub fetcher: Arc<dyn RepoFetcher>,
    pub creator: WorkspaceCreator,
}

#[derive(Clone)]
struct SharedContext {
    cache: Arc<dyn ExecutionCache>,
    fetcher: Arc<dyn RepoFetcher>,
    creator: WorkspaceCreator,
    runtime: Arc<dyn ContainerRuntime>,
    event_channel: Arc<EventChannel>,

    queue: Arc<Injector<Arc<Task>>>,
    image_digests: Arc<RwLock<FxHashMap<String, String>>>,
    specs: Arc<Mutex<Vec<ChangesetSpec>>>,
    errors: Arc<Mutex<Vec<TaskError>>>,
    log_files: Arc<Mutex<Vec<PathBuf>>>,

    clear_cache: bool,
    keep_logs: bool,
    timeout: Duration,
    temp_dir: PathBuf,
    cancel: CancellationToken,
}

/// Drains queued tasks through a bounded worker pool, coordinating the
/// fingerprint, cache, workspace, step, template, and grouping machinery,
/// and aggregating the changeset specs every task produces.
///
pub struct Executor {
    ctx: SharedContext,
    parallelism: usize,
    tasks: Mutex<Vec<Arc<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        opts: ExecutorOpts,
        runtime: Arc<dyn ContainerRuntime>,
        event_channel: Arc<EventChannel>,
    ) -> Executor {
        let parallelism = if opts.parallelism == 0 {
            num_cpus::get()
        } else {
            opts.parallelism
        };

        let ctx = SharedContext {
            cache: opts.cache,
            fetcher: opts.fetcher,
            creator: opts.creator,
            runtime,
            event_channel,
            queue: Arc::new(Injector::new()),
            image_digests: Arc::new(RwLock::new(FxHashMap::default())),
            specs: Arc::new(Mutex::new(vec![])),
            errors: Arc::new(Mutex::new(vec![])),
            log_files: Arc::new(Mutex::new(vec![])),
            clear_cache: opts.clear_cache,
            keep_logs: opts.keep_logs,
            timeout: opts.timeout,
            temp_dir: opts.temp_dir,
            cancel: CancellationToken::new(),
        };

        Executor {
            ctx,
            parallelism,
            tasks: Mutex::new(vec![]),
            handles: Mutex::new(vec![]),
        }
    }

    /// Queue one task. Group rules are validated against this repository
    /// up front so a colliding transform fails before any work starts.
    pub fn add_task(
        &self,
        repository: Repository,
        steps: Vec<Step>,
        transform: Option<TransformChanges>,
        template: ChangesetTemplate,
    ) -> Result<(), DiffError> {
        if let Some(transform) = &transform {
            diff::validate_groups(&repository.name, &template.branch, &transform.group)?;
        }

        let task = Arc::new(Task::new(repository, steps, transform, template));
        self.ctx.event_channel.send(Event::TaskQueued {
            repository: task.repository.name.clone(),
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Cancelling this token aborts in-flight steps, releases workspaces,
    /// and leaves the cache untouched.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Resolve every distinct image once, then let the worker pool loose
    /// on the queue.
    #[tracing::instrument(name = "Executor::start", skip(self))]
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let tasks: Vec<Arc<Task>> = self.tasks.lock().unwrap().clone();

        let mut seen = FxHashSet::default();
        let mut images = vec![];
        for task in &tasks {
            for step in &task.steps {
                if seen.insert(step.container.clone()) {
                    images.push(step.container.clone());
                }
            }
        }

        self.ctx.event_channel.send(Event::ResolvingImages {
            count: images.len(),
        });
        let mut digests = FxHashMap::default();
        for image in images {
            let digest = self.ctx.runtime.resolve_image(&image).await.map_err(|err| {
                ExecutorError::ImageResolution {
                    image: image.clone(),
                    err,
                }
            })?;
            self.ctx.event_channel.send(Event::ImageResolved {
                image: image.clone(),
                digest: digest.clone(),
            });
            digests.insert(image, digest);
        }
        *self.ctx.image_digests.write().unwrap() = digests.clone();

        // No two tasks may share both repository and fingerprint within
        // one run.
        let mut seen_keys = FxHashSet::default();
        let mut queued = 0;
        for task in tasks {
            if let Ok(key) = ExecutionCacheKey::for_task(&task, &digests) {
                if !seen_keys.insert((task.repository.id.clone(), key)) {
                    debug!(
                        "Skipping duplicate task for {} with key {}",
                        task.repository.name, key
                    );
                    continue;
                }
            }
            self.ctx.queue.push(task);
            queued += 1;
        }

        self.ctx.event_channel.send(Event::ExecutionStarted {
            task_count: queued,
        });

        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..self.parallelism {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(worker_loop(worker_id, ctx)));
        }

        Ok(())
    }

    /// Block until every worker drained the queue. Specs from succeeded
    /// tasks are returned even when other tasks failed.
    #[tracing::instrument(name = "Executor::wait", skip(self))]
    pub async fn wait(&self) -> (Vec<ChangesetSpec>, Option<TaskErrors>) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                self.ctx.errors.lock().unwrap().push(TaskError::Worker {
                    detail: err.to_string(),
                });
            }
        }

        let specs = std::mem::take(&mut *self.ctx.specs.lock().unwrap());
        let errors = std::mem::take(&mut *self.ctx.errors.lock().unwrap());
        self.ctx.event_channel.send(Event::ExecutionCompleted {
            errored: !errors.is_empty(),
        });

        if errors.is_empty() {
            (specs, None)
        } else {
            (specs, Some(TaskErrors(errors)))
        }
    }

    /// Point-in-time snapshots for the status sink.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .map(|task| task.status())
            .collect()
    }

    /// Paths of retained step logs; empty unless `keep_logs` is on.
    pub fn log_files(&self) -> Vec<PathBuf> {
        self.ctx.log_files.lock().unwrap().clone()
    }
}

async fn worker_loop(worker_id: usize, ctx: SharedContext) {
    debug!("Worker {} starting", worker_id);
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let task = match ctx.queue.steal() {
            Steal::Success(task) => task,
            Steal::Empty => break,
            Steal::Retry => {
                tokio::task::yield_now().await;
                continue;
            }
        };

        process_task(&ctx, task).await;
    }
    debug!("Worker {} done", worker_id);
}

async fn process_task(ctx: &SharedContext, task: Arc<Task>) {
    let repository = task.repository.name.clone();
    task.transition(TaskState::Running);
    ctx.event_channel.send(Event::TaskStarted {
        repository: repository.clone(),
    });

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => Err(TaskError::Cancelled {
            repository: repository.clone(),
        }),
        result = tokio::time::timeout(ctx.timeout, execute_task(ctx, &task)) => match result {
            Ok(result) => result,
            Err(_) => Err(TaskError::Timeout {
                repository: repository.clone(),
                timeout: ctx.timeout,
            }),
        },
    };

    match outcome {
        Ok(specs) => {
            task.transition(TaskState::Completed);
            ctx.event_channel.send(Event::TaskCompleted {
                repository,
                changesets: specs.len(),
            });
            ctx.specs.lock().unwrap().extend(specs);
        }
        Err(err @ TaskError::Cancelled { .. }) => {
            task.transition(TaskState::Cancelled);
            ctx.event_channel.send(Event::TaskCancelled { repository });
            ctx.errors.lock().unwrap().push(err);
        }
        Err(err) => {
            task.transition(TaskState::Failed);
            ctx.event_channel.send(Event::TaskFailed {
                repository,
                error: err.to_string(),
            });
            ctx.errors.lock().unwrap().push(err);
        }
    }
}

#[tracing::instrument(name = "Executor::execute_task", skip_all, fields(repo = %task.repository.name))]
async fn execute_task(ctx: &SharedContext, task: &Task) -> Result<Vec<ChangesetSpec>, TaskError> {
    let repository = task.repository.name.clone();
    let digests = ctx.image_digests.read().unwrap().clone();

    let key =
        ExecutionCacheKey::for_task(task, &digests).map_err(|err| TaskError::Fingerprint {
            repository: repository.clone(),
            err,
        })?;

    let mut cached = None;
    if !ctx.clear_cache {
        match ctx.cache.get(&key).await {
            Ok(hit) => cached = hit,
            Err(err) => {
                warn!("Cache read for {} failed, treating as miss: {}", repository, err)
            }
        }
    }

    let result = match cached {
        Some(result) => {
            task.mark_cached();
            ctx.event_channel.send(Event::CacheHit {
                repository: repository.clone(),
            });
            result
        }
        None => run_task_steps(ctx, task, &digests, &key).await?,
    };

    build_changeset_specs(task, &result)
}

async fn run_task_steps(
    ctx: &SharedContext,
    task: &Task,
    digests: &FxHashMap<String, String>,
    key: &ExecutionCacheKey,
) -> Result<ExecutionResult, TaskError> {
    let repository = task.repository.name.clone();

    ctx.event_channel.send(Event::ArchiveDownloading {
        repository: repository.clone(),
    });
    let archive = ctx
        .fetcher
        .fetch(&task.repository)
        .await
        .map_err(|err| TaskError::Fetch {
            repository: repository.clone(),
            err,
        })?;

    ctx.event_channel.send(Event::ArchiveUnpacking {
        repository: repository.clone(),
    });
    let workspace = ctx
        .creator
        .create(&task.repository, &archive)
        .await
        .map_err(|err| TaskError::Workspace {
            repository: repository.clone(),
            err,
        })?;

    let mut log = open_log_file(ctx, task)?;

    let initial = workspace
        .snapshot()
        .await
        .map_err(|err| TaskError::Workspace {
            repository: repository.clone(),
            err,
        })?;

    let runner = StepRunner::new(ctx.runtime.clone());
    let mut env = Environment::new(repository.clone(), task.repository.branch_name());
    let mut previous = initial.clone();
    let total = task.steps.len();

    for (index, step) in task.steps.iter().enumerate() {
        task.start_step(index);
        ctx.event_channel.send(Event::StepStarted {
            repository: repository.clone(),
            step: index,
            total,
            run: step.run.clone(),
        });

        let image = digests
            .get(&step.container)
            .cloned()
            .unwrap_or_else(|| step.container.clone());

        let result = runner
            .run(step, &image, &workspace, &previous)
            .await
            .map_err(|err| TaskError::Step {
                repository: repository.clone(),
                step: index,
                err,
            })?;

        if let Some(log) = log.as_mut() {
            append_step_log(log, index, &result.stdout, &result.stderr).await;
        }

        env.record_step(StepSnapshot {
            stdout: result.stdout,
            stderr: result.stderr,
            changed: result.changed_files,
        });

        for (name, output) in &step.outputs {
            let rendered =
                template::evaluate(&output.value, &env).map_err(|err| TaskError::Template {
                    repository: repository.clone(),
                    err,
                })?;
            let value = template::parse_output(name, output.format, &rendered).map_err(|err| {
                TaskError::Template {
                    repository: repository.clone(),
                    err,
                }
            })?;
            env.add_output(name.clone(), value);
        }

        previous = result.snapshot;
        task.finish_step();
    }

    let diff = diff::diff_trees(workspace.base_root(), workspace.work_root())
        .await
        .map_err(|err| TaskError::Diff {
            repository: repository.clone(),
            err,
        })?;

    let result = ExecutionResult {
        diff,
        changed_files: previous.changed_since(&initial),
        outputs: env.outputs_json(),
    };

    if let Err(err) = ctx.cache.set(key, &result).await {
        warn!("Could not write cache entry for {}: {}", repository, err);
    }

    Ok(result)
}

fn open_log_file(ctx: &SharedContext, task: &Task) -> Result<Option<tokio::fs::File>, TaskError> {
    if !ctx.keep_logs {
        return Ok(None);
    }

    let repository = task.repository.name.clone();
    let slug = repository.replace('/', "-");

    let io_err = |err: std::io::Error| TaskError::Log {
        repository: repository.clone(),
        err,
    };

    std::fs::create_dir_all(&ctx.temp_dir).map_err(io_err)?;
    let tempfile = tempfile::Builder::new()
        .prefix(&format!("changeset-{}-", slug))
        .suffix(".log")
        .tempfile_in(&ctx.temp_dir)
        .map_err(io_err)?;

    let (file, path) = tempfile.keep().map_err(|err| TaskError::Log {
        repository: repository.clone(),
        err: err.error,
    })?;

    task.set_log_file(path.clone());
    ctx.log_files.lock().unwrap().push(path.clone());
    ctx.event_channel.send(Event::LogFileKept { repository, path });

    Ok(Some(tokio::fs::File::from_std(file)))
}

async fn append_step_log(log: &mut tokio::fs::File, index: usize, stdout: &[u8], stderr: &[u8]) {
    let header = format!("=== step {} ===\n", index);
    let chunks: [&[u8]; 5] = [
        header.as_bytes(),
        b"--- stdout\n",
        stdout,
        b"--- stderr\n",
        stderr,
    ];
    for chunk in chunks {
        if let Err(err) = log.write_all(chunk).await {
            warn!("Could not append to step log: {}", err);
            return;
        }
    }
    let _ = log.flush().await;
}

fn build_changeset_specs(
    task: &Task,
    result: &ExecutionResult,
) -> Result<Vec<ChangesetSpec>, TaskError> {
    if result.diff.is_empty() {
        return Ok(vec![]);
    }

    let repo = &task.repository;
    let env = Environment::from_result(
        repo.name.clone(),
        repo.branch_name(),
        &result.changed_files,
        &result.outputs,
    );

    let render = |text: &str| {
        template::evaluate(text, &env).map_err(|err| TaskError::Template {
            repository: repo.name.clone(),
            err,
        })
    };

    let branch = render(&task.template.branch)?;
    let title = render(task.template.title.value(&repo.name))?;
    let body = render(&task.template.body)?;
    let message = render(&task.template.commit.message)?;
    let (author_name, author_email) = match &task.template.commit.author {
        Some(author) => (render(&author.name)?, render(&author.email)?),
        None => (
            DEFAULT_AUTHOR_NAME.to_string(),
            DEFAULT_AUTHOR_EMAIL.to_string(),
        ),
    };

    let groups = task
        .transform
        .as_ref()
        .map(|transform| diff::groups_for_repository(&repo.name, &transform.group))
        .unwrap_or_default();

    let by_branch = if groups.is_empty() {
        let mut map = BTreeMap::new();
        map.insert(branch, result.diff.clone());
        map
    } else {
        diff::group_file_diffs(&result.diff, &branch, &groups)
    };

    let published = task.template.published.value(&repo.name);

    let mut specs = vec![];
    for (branch, diff_text) in by_branch {
        if diff_text.is_empty() {
            continue;
        }

        specs.push(ChangesetSpec {
            base_repository: repo.id.clone(),
            base_ref: repo.base_ref(),
            base_rev: repo.rev().to_string(),
            head_repository: repo.id.clone(),
            head_ref: ensure_refs_heads(&branch),
            title: title.clone(),
            body: body.clone(),
            commits: vec![GitCommitDescription {
                message: message.clone(),
                diff: diff_text,
                author_name: author_name.clone(),
                author_email: author_email.clone(),
            }],
            published,
        });
    }

    Ok(specs)
}
