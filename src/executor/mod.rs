mod cache;
mod diff;
#[allow(clippy::module_inception)]
mod executor;
mod fingerprint;
mod step_runner;
mod task;
mod template;

pub use cache::{CacheError, ExecutionCache, ExecutionResult, FileSystemCache, InMemoryCache};
pub use diff::{
    diff_trees, group_file_diffs, groups_for_repository, parse_multi_file_diff, unified_diff,
    validate_groups, DiffError, FileDiff,
};
pub use executor::{Executor, ExecutorError, ExecutorOpts, TaskError, TaskErrors};
pub use fingerprint::{ExecutionCacheKey, FingerprintError};
pub use step_runner::{StepError, StepResult, StepRunner};
pub use task::{Task, TaskState, TaskStatus};
pub use template::{evaluate, parse_output, Environment, StepSnapshot, TemplateError, Value};
