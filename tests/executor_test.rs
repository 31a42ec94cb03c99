use async_trait::async_trait;
use campaigner::api::{Branch, ChangesetSpec, ExternalRepository, Repository, Target};
use campaigner::archive::{RepoArchive, RepoFetcher, RepoFetcherError};
use campaigner::container::{ContainerError, ContainerRuntime, RunOutput, RunSpec};
use campaigner::events::EventChannel;
use campaigner::executor::{
    parse_multi_file_diff, Executor, ExecutorOpts, InMemoryCache, TaskError, TaskErrors,
};
use campaigner::spec::{
    ChangesetTemplate, Group, Output, OutputFormat, Step, TransformChanges,
};
use campaigner::workspace::WorkspaceCreator;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn src_cli_repo() -> Repository {
    Repository {
        id: "src-cli".into(),
        name: "github.com/sourcegraph/src-cli".into(),
        external_repository: ExternalRepository {
            service_type: "github".into(),
        },
        default_branch: Branch {
            name: "main".into(),
            target: Target {
                oid: "d34db33f".into(),
            },
        },
        branch: None,
    }
}

fn sourcegraph_repo() -> Repository {
    Repository {
        id: "sourcegraph".into(),
        name: "github.com/sourcegraph/sourcegraph".into(),
        external_repository: ExternalRepository {
            service_type: "github".into(),
        },
        default_branch: Branch {
            name: "main".into(),
            target: Target {
                oid: "f00b4r3r".into(),
            },
        },
        branch: None,
    }
}

/// Executes steps with the host shell straight against the work tree,
/// counting invocations and concurrency along the way.
#[derive(Debug, Default)]
struct ShellRuntime {
    runs: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for ShellRuntime {
    async fn resolve_image(&self, image: &str) -> Result<String, ContainerError> {
        Ok(format!("sha256:{}", image))
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, ContainerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(live, Ordering::SeqCst);

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&spec.run)
            .current_dir(&spec.workdir)
            .envs(&spec.env)
            .output()
            .await
            .map_err(|err| ContainerError::Invocation { err });

        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        let output = output?;
        Ok(RunOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Serves per-repository file sets as plain tar archives from disk.
#[derive(Debug)]
struct TarFetcher {
    dir: PathBuf,
    archives: BTreeMap<String, Vec<(String, String)>>,
}

impl TarFetcher {
    fn new(dir: PathBuf, archives: &[(&Repository, &[(&str, &str)])]) -> Self {
        let archives = archives
            .iter()
            .map(|(repo, files)| {
                (
                    repo.id.clone(),
                    files
                        .iter()
                        .map(|(name, contents)| (name.to_string(), contents.to_string()))
                        .collect(),
                )
            })
            .collect();
        Self { dir, archives }
    }
}

#[async_trait]
impl RepoFetcher for TarFetcher {
    async fn fetch(&self, repo: &Repository) -> Result<RepoArchive, RepoFetcherError> {
        let files = self.archives.get(&repo.id).cloned().unwrap_or_default();

        let tempfile = tempfile::Builder::new()
            .suffix(".tar")
            .tempfile_in(&self.dir)
            .map_err(|err| RepoFetcherError::FileSystem {
                path: self.dir.clone(),
                err,
            })?;
        let (file, path) = tempfile.keep().map_err(|err| RepoFetcherError::FileSystem {
            path: self.dir.clone(),
            err: err.error,
        })?;

        let mut builder = tar::Builder::new(file);
        for (name, contents) in &files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .map_err(|err| RepoFetcherError::FileSystem {
                    path: path.clone(),
                    err,
                })?;
        }
        builder
            .into_inner()
            .map_err(|err| RepoFetcherError::FileSystem {
                path: path.clone(),
                err,
            })?;

        Ok(RepoArchive::new(path, repo.rev().to_string()))
    }
}

fn step(run: &str) -> Step {
    Step {
        run: run.to_string(),
        container: "doesntmatter:13".to_string(),
        env: BTreeMap::new(),
        outputs: BTreeMap::new(),
    }
}

fn template(branch: &str) -> ChangesetTemplate {
    ChangesetTemplate {
        branch: branch.to_string(),
        ..Default::default()
    }
}

struct Harness {
    scratch: tempfile::TempDir,
    cache: Arc<InMemoryCache>,
    runtime: Arc<ShellRuntime>,
}

impl Harness {
    fn new() -> Self {
        Self {
            scratch: tempfile::tempdir().unwrap(),
            cache: Arc::new(InMemoryCache::new()),
            runtime: Arc::new(ShellRuntime::default()),
        }
    }

    fn executor(&self, parallelism: usize, timeout: Duration, fetcher: Arc<TarFetcher>) -> Executor {
        Executor::new(
            ExecutorOpts {
                cache: self.cache.clone(),
                clear_cache: false,
                keep_logs: false,
                timeout,
                temp_dir: self.scratch.path().join("tmp"),
                parallelism,
                fetcher,
                creator: WorkspaceCreator::new(self.scratch.path().join("workspaces")),
            },
            self.runtime.clone(),
            Arc::new(EventChannel::new()),
        )
    }

    fn fetcher(&self, archives: &[(&Repository, &[(&str, &str)])]) -> Arc<TarFetcher> {
        let dir = self.scratch.path().join("archives");
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(TarFetcher::new(dir, archives))
    }
}

async fn execute(
    harness: &Harness,
    fetcher: Arc<TarFetcher>,
    tasks: &[(&Repository, Vec<Step>, Option<TransformChanges>, ChangesetTemplate)],
) -> (Vec<ChangesetSpec>, Option<TaskErrors>) {
    let executor = harness.executor(2, Duration::from_secs(30), fetcher);
    for (repo, steps, transform, template) in tasks {
        executor
            .add_task(
                Repository::clone(repo),
                steps.clone(),
                transform.clone(),
                template.clone(),
            )
            .unwrap();
    }
    executor.start().await.unwrap();
    executor.wait().await
}

/// `{ (repo id, branch) -> changed file paths }` for assertion tables.
fn files_by_branch(specs: &[ChangesetSpec]) -> BTreeMap<(String, String), BTreeSet<String>> {
    specs
        .iter()
        .map(|spec| {
            assert_eq!(spec.commits.len(), 1);
            let files = parse_multi_file_diff(&spec.commits[0].diff)
                .into_iter()
                .map(|fd| fd.path)
                .collect();
            (
                (spec.base_repository.clone(), spec.branch().to_string()),
                files,
            )
        })
        .collect()
}

#[tokio::test]
async fn an_empty_diff_produces_no_specs_but_one_cache_entry() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(&repo, &[("README.md", "# Welcome to the README\n")])]);

    let (specs, errors) = execute(
        &harness,
        fetcher,
        &[(&repo, vec![step("true")], None, template("my-branch"))],
    )
    .await;

    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert!(specs.is_empty());
    assert_eq!(harness.cache.size(), 1);
}

#[tokio::test]
async fn a_single_file_change_lands_on_the_template_branch() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(
        &repo,
        &[
            ("README.md", "# Welcome to the README\n"),
            ("main.go", "package main\n"),
        ],
    )]);

    let (specs, errors) = execute(
        &harness,
        fetcher,
        &[(
            &repo,
            vec![step("echo 'package main' >> README.md")],
            None,
            template("my-branch"),
        )],
    )
    .await;

    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert_eq!(specs.len(), 1);

    let spec = &specs[0];
    assert_eq!(spec.base_repository, "src-cli");
    assert_eq!(spec.head_repository, "src-cli");
    assert_eq!(spec.base_ref, "refs/heads/main");
    assert_eq!(spec.base_rev, "d34db33f");
    assert_eq!(spec.head_ref, "refs/heads/my-branch");
    assert!(spec.published);

    let files = files_by_branch(&specs);
    assert_eq!(
        files[&("src-cli".to_string(), "my-branch".to_string())],
        BTreeSet::from(["README.md".to_string()])
    );
}

#[tokio::test]
async fn transform_groups_partition_the_diff_per_repository() {
    let harness = Harness::new();
    let src_cli = src_cli_repo();
    let sourcegraph = sourcegraph_repo();

    let files: &[(&str, &str)] = &[
        ("README.md", "# Welcome to the README\n"),
        ("a/a.go", "package a"),
        ("a/b/b.go", "package b"),
        ("a/b/c/c.go", "package c"),
    ];
    let fetcher = harness.fetcher(&[(&src_cli, files), (&sourcegraph, files)]);

    let steps = vec![
        step("echo 'var a = 1' >> a/a.go"),
        step("echo 'var b = 2' >> a/b/b.go"),
        step("echo 'var c = 3' >> a/b/c/c.go"),
    ];
    let transform = TransformChanges {
        group: vec![
            Group {
                directory: "a/b/c".into(),
                branch: "in-directory-c".into(),
                repository: None,
            },
            Group {
                directory: "a/b".into(),
                branch: "in-directory-b".into(),
                repository: Some(sourcegraph.name.clone()),
            },
        ],
    };

    let (specs, errors) = execute(
        &harness,
        fetcher,
        &[
            (
                &src_cli,
                steps.clone(),
                Some(transform.clone()),
                template("my-branch"),
            ),
            (&sourcegraph, steps, Some(transform), template("my-branch")),
        ],
    )
    .await;

    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert_eq!(specs.len(), 4);

    let have = files_by_branch(&specs);
    let mut want = BTreeMap::new();
    want.insert(
        ("src-cli".to_string(), "my-branch".to_string()),
        BTreeSet::from(["a/a.go".to_string(), "a/b/b.go".to_string()]),
    );
    want.insert(
        ("src-cli".to_string(), "in-directory-c".to_string()),
        BTreeSet::from(["a/b/c/c.go".to_string()]),
    );
    want.insert(
        ("sourcegraph".to_string(), "my-branch".to_string()),
        BTreeSet::from(["a/a.go".to_string()]),
    );
    want.insert(
        ("sourcegraph".to_string(), "in-directory-b".to_string()),
        BTreeSet::from(["a/b/b.go".to_string(), "a/b/c/c.go".to_string()]),
    );
    assert_eq!(have, want);
}

#[tokio::test]
async fn outputs_flow_into_the_changeset_template() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(
        &repo,
        &[
            ("README.md", "# Welcome to the README\n"),
            ("main.go", "package main\n"),
        ],
    )]);

    let mut first = step("echo 'var a = 1' >> main.go");
    first.outputs.insert(
        "myOutputName1".into(),
        Output {
            value: "${{ index(step.modified_files, 0) }}".into(),
            format: OutputFormat::Text,
        },
    );

    let mut second = step(r#"echo -n "Hello World!""#);
    second.outputs.insert(
        "myOutputName2".into(),
        Output {
            value: r#"thisStepStdout: "${{ step.stdout }}""#.into(),
            format: OutputFormat::Yaml,
        },
    );
    second.outputs.insert(
        "myOutputName3".into(),
        Output {
            value: "cool-suffix".into(),
            format: OutputFormat::Text,
        },
    );

    let template: ChangesetTemplate = serde_yaml::from_str(
        r#"
title: "myOutputName1=${{ outputs.myOutputName1 }}"
body: |-
  myOutputName1=${{ outputs.myOutputName1 }},myOutputName2=${{ outputs.myOutputName2.thisStepStdout }}
  modified_files=${{ steps.modified_files }}
  added_files=${{ steps.added_files }}
  repository_name=${{ repository.name }}
branch: "templated-branch-${{ outputs.myOutputName3 }}"
commit:
  message: "myOutputName1=${{ outputs.myOutputName1 }}"
  author:
    name: "myOutputName1=${{ outputs.myOutputName1 }}"
    email: "campaigner@example.com"
"#,
    )
    .unwrap();

    let (specs, errors) = execute(
        &harness,
        fetcher,
        &[(&repo, vec![first, second], None, template)],
    )
    .await;

    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert_eq!(specs.len(), 1);

    let spec = &specs[0];
    assert_eq!(spec.head_ref, "refs/heads/templated-branch-cool-suffix");
    assert_eq!(spec.title, "myOutputName1=main.go");
    assert!(spec.body.contains("myOutputName2=Hello World!"));
    assert!(spec.body.contains("modified_files=[main.go]"));
    assert!(spec.body.contains("added_files=[]"));
    assert!(spec
        .body
        .contains("repository_name=github.com/sourcegraph/src-cli"));
    assert_eq!(spec.commits[0].message, "myOutputName1=main.go");
    assert_eq!(spec.commits[0].author_name, "myOutputName1=main.go");
    assert_eq!(spec.commits[0].author_email, "campaigner@example.com");

    let files = files_by_branch(&specs);
    assert_eq!(
        files[&("src-cli".to_string(), "templated-branch-cool-suffix".to_string())],
        BTreeSet::from(["main.go".to_string()])
    );
}

#[tokio::test]
async fn a_warm_cache_skips_the_container_runtime_entirely() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let archives: &[(&Repository, &[(&str, &str)])] =
        &[(&repo, &[("README.md", "# Welcome to the README\n")])];
    let tasks = |t: &Harness| {
        (
            t.fetcher(archives),
            vec![step("echo 'package main' >> README.md")],
        )
    };

    // Cold run.
    let (fetcher, steps) = tasks(&harness);
    let (cold_specs, errors) = execute(
        &harness,
        fetcher,
        &[(&repo, steps, None, template("my-branch"))],
    )
    .await;
    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    let cold_runs = harness.runtime.runs.load(Ordering::SeqCst);
    assert!(cold_runs > 0);
    assert_eq!(harness.cache.size(), 1);

    // Warm run: identical specs, not a single container invocation more.
    let (fetcher, steps) = tasks(&harness);
    let (warm_specs, errors) = execute(
        &harness,
        fetcher,
        &[(&repo, steps, None, template("my-branch"))],
    )
    .await;
    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert_eq!(harness.runtime.runs.load(Ordering::SeqCst), cold_runs);
    assert_eq!(harness.cache.size(), 1);
    assert_eq!(cold_specs, warm_specs);
}

#[tokio::test]
async fn colliding_group_branches_are_rejected_at_add_time() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(&repo, &[("README.md", "x\n")])]);
    let executor = harness.executor(1, Duration::from_secs(30), fetcher);

    let transform = TransformChanges {
        group: vec![
            Group {
                directory: "a".into(),
                branch: "x".into(),
                repository: None,
            },
            Group {
                directory: "b".into(),
                branch: "x".into(),
                repository: None,
            },
        ],
    };

    let err = executor
        .add_task(repo.clone(), vec![step("true")], Some(transform), template("main"))
        .unwrap_err();

    assert!(err
        .to_string()
        .contains("multiple changesets in repository github.com/sourcegraph/src-cli to have the same branch"));
}

#[tokio::test]
async fn at_most_parallelism_tasks_run_concurrently() {
    let harness = Harness::new();
    let repos: Vec<Repository> = (0..4)
        .map(|i| {
            let mut repo = src_cli_repo();
            repo.id = format!("repo-{}", i);
            repo.name = format!("github.com/sourcegraph/repo-{}", i);
            repo
        })
        .collect();

    const FILES: &[(&str, &str)] = &[("README.md", "x\n")];
    let archives: Vec<(&Repository, &[(&str, &str)])> =
        repos.iter().map(|repo| (repo, FILES)).collect();
    let fetcher = harness.fetcher(&archives);

    let executor = harness.executor(2, Duration::from_secs(30), fetcher);
    for repo in &repos {
        executor
            .add_task(repo.clone(), vec![step("sleep 0.3")], None, template("b"))
            .unwrap();
    }
    executor.start().await.unwrap();
    let (_, errors) = executor.wait().await;

    assert!(errors.is_none(), "unexpected errors: {:?}", errors);
    assert_eq!(harness.runtime.runs.load(Ordering::SeqCst), 4);
    assert!(harness.runtime.max_concurrent.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn a_failing_step_fails_its_task_but_not_the_run() {
    let harness = Harness::new();
    let good = src_cli_repo();
    let mut bad = sourcegraph_repo();
    bad.id = "bad".into();

    let fetcher = harness.fetcher(&[
        (&good, &[("README.md", "# Welcome\n")]),
        (&bad, &[("README.md", "# Welcome\n")]),
    ]);

    let executor = harness.executor(1, Duration::from_secs(30), fetcher);
    executor
        .add_task(
            good.clone(),
            vec![step("echo changed >> README.md")],
            None,
            template("b"),
        )
        .unwrap();
    executor
        .add_task(
            bad.clone(),
            vec![step("echo kaput >&2; exit 1")],
            None,
            template("b"),
        )
        .unwrap();

    executor.start().await.unwrap();
    let (specs, errors) = executor.wait().await;

    // The good task still delivered its changeset spec.
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].base_repository, "src-cli");

    let errors = errors.expect("the failing step should surface");
    assert_eq!(errors.len(), 1);
    let text = errors.to_string();
    assert!(text.contains("github.com/sourcegraph/sourcegraph"));
    assert!(text.contains("kaput"));

    // Only the succeeded task was cached.
    assert_eq!(harness.cache.size(), 1);
}

#[tokio::test]
async fn the_task_timeout_discards_the_partial_result() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(&repo, &[("README.md", "x\n")])]);

    let executor = harness.executor(1, Duration::from_millis(300), fetcher);
    executor
        .add_task(repo.clone(), vec![step("sleep 5")], None, template("b"))
        .unwrap();
    executor.start().await.unwrap();
    let (specs, errors) = executor.wait().await;

    assert!(specs.is_empty());
    let errors = errors.expect("the timeout should surface");
    assert!(matches!(errors.0[0], TaskError::Timeout { .. }));
    assert_eq!(harness.cache.size(), 0);
}

#[tokio::test]
async fn cancellation_aborts_without_writing_to_the_cache() {
    let harness = Harness::new();
    let repo = src_cli_repo();
    let fetcher = harness.fetcher(&[(&repo, &[("README.md", "x\n")])]);

    let executor = harness.executor(1, Duration::from_secs(30), fetcher);
    executor
        .add_task(repo.clone(), vec![step("sleep 5")], None, template("b"))
        .unwrap();
    executor.start().await.unwrap();

    let cancel = executor.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let (specs, errors) = executor.wait().await;
    assert!(specs.is_empty());
    let errors = errors.expect("cancellation should surface");
    assert!(matches!(errors.0[0], TaskError::Cancelled { .. }));
    assert_eq!(harness.cache.size(), 0);
}
