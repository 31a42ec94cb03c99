use super::{default_cache_dir, default_temp_dir, read_spec_file};
use crate::reporter::StatusReporter;
use anyhow::Context;
use campaigner::api::HttpClient;
use campaigner::archive::HttpRepoFetcher;
use campaigner::container::DockerRuntime;
use campaigner::events::EventChannel;
use campaigner::executor::{Executor, ExecutorOpts, FileSystemCache};
use campaigner::service::Service;
use campaigner::spec::CampaignSpec;
use campaigner::workspace::WorkspaceCreator;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use url::Url;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "apply",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Execute a campaign spec and upload it to the back end"
)]
pub struct ApplyCommand {
    #[structopt(
        short = "f",
        long = "file",
        help = "The campaign spec file to read, or - for stdin"
    )]
    file: String,

    #[structopt(
        short = "n",
        long = "namespace",
        help = "The user or organization namespace to place the campaign within"
    )]
    namespace: String,

    #[structopt(
        long = "endpoint",
        env = "CAMPAIGNER_ENDPOINT",
        help = "The back end to talk to"
    )]
    endpoint: Url,

    #[structopt(
        long = "token",
        env = "CAMPAIGNER_ACCESS_TOKEN",
        hide_env_values = true,
        help = "The access token for the back end"
    )]
    token: String,

    #[structopt(long = "allow-unsupported", help = "Allow unsupported code hosts")]
    allow_unsupported: bool,

    #[structopt(
        long = "cache",
        parse(from_os_str),
        help = "Directory for caching execution results"
    )]
    cache_dir: Option<PathBuf>,

    #[structopt(
        long = "clear-cache",
        help = "Ignore cached results and execute all steps anew"
    )]
    clear_cache: bool,

    #[structopt(long = "keep-logs", help = "Retain step logs after execution")]
    keep_logs: bool,

    #[structopt(
        long = "tmp",
        parse(from_os_str),
        help = "Directory for temporary data such as repository archives, workspaces and log files. Can also be set with CAMPAIGNS_TMP_DIR; this flag wins."
    )]
    temp_dir: Option<PathBuf>,

    #[structopt(
        short = "j",
        long = "parallelism",
        help = "The maximum number of parallel tasks. (Default: one per CPU.)"
    )]
    parallelism: Option<usize>,

    #[structopt(
        long = "timeout",
        default_value = "3600",
        help = "The maximum number of seconds a single task may take"
    )]
    timeout: u64,
}

impl ApplyCommand {
    #[tracing::instrument(name = "ApplyCommand::run", skip(self))]
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let raw_spec = read_spec_file(&self.file)?;
        let spec = CampaignSpec::parse(&raw_spec).context("parsing campaign spec")?;
        println!("{} Parsed campaign spec {:?}", style("✔").green(), spec.name);

        let client = Arc::new(HttpClient::new(self.endpoint.clone(), self.token.clone()));
        let svc = Service::new(client);

        let namespace = svc
            .resolve_namespace(&self.namespace)
            .await
            .context("resolving namespace")?;

        let resolution = svc
            .resolve_repositories(&spec, self.allow_unsupported)
            .await
            .context("resolving repositories")?;
        if !resolution.unsupported.is_empty() {
            eprintln!(
                "{}",
                style(
                    "Some repositories are hosted on unsupported code hosts and will be skipped. \
                     Use --allow-unsupported to avoid skipping them."
                )
                .yellow()
            );
            for name in resolution.unsupported.names() {
                eprintln!("  {}", name);
            }
        }

        let temp_dir = self.temp_dir.clone().unwrap_or_else(default_temp_dir);
        let cache_dir = self.cache_dir.clone().unwrap_or_else(default_cache_dir);

        let event_channel = Arc::new(EventChannel::new());
        let executor = Executor::new(
            ExecutorOpts {
                cache: Arc::new(FileSystemCache::new(cache_dir)),
                clear_cache: self.clear_cache,
                keep_logs: self.keep_logs,
                timeout: Duration::from_secs(self.timeout),
                temp_dir: temp_dir.clone(),
                parallelism: self.parallelism.unwrap_or_else(num_cpus::get),
                fetcher: Arc::new(HttpRepoFetcher::new(
                    self.endpoint.clone(),
                    self.token.clone(),
                    temp_dir.join("archives"),
                )),
                creator: WorkspaceCreator::new(temp_dir),
            },
            Arc::new(DockerRuntime::new()),
            event_channel.clone(),
        );

        let mut specs = vec![];
        if !spec.steps.is_empty() {
            let template = spec
                .changeset_template
                .clone()
                .context("campaign spec has steps but no changesetTemplate")?;

            for repo in &resolution.repos {
                executor.add_task(
                    repo.clone(),
                    spec.steps.clone(),
                    spec.transform_changes.clone(),
                    template.clone(),
                )?;
            }

            let cancel = executor.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            executor.start().await.context("resolving images")?;

            let reporter = StatusReporter::new(event_channel.clone());
            let ((collected, errors), ()) =
                futures::future::join(executor.wait(), reporter.run()).await;

            if self.keep_logs {
                let log_files = executor.log_files();
                if !log_files.is_empty() {
                    println!("{}", style("Preserving log files:").green());
                    for file in &log_files {
                        println!("  {}", file.display());
                    }
                }
            }

            if let Some(errors) = errors {
                return Err(errors.into());
            }
            specs = collected;
        }

        let imports = svc
            .build_import_specs(&spec)
            .await
            .context("resolving importChangesets")?;

        let progress = ProgressBar::new((specs.len() + imports.len()) as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>12.cyan.bold} [{bar:25}] {pos}/{len}")
                .progress_chars("=> "),
        );
        progress.set_prefix("Uploading");

        let ids = svc
            .upload_changeset_specs(&specs, &imports, |done| {
                progress.set_position(done as u64);
            })
            .await
            .context("uploading changeset specs")?;
        progress.finish_and_clear();
        println!(
            "{} Sent {} changeset specs",
            style("✔").green(),
            ids.len()
        );

        let (id, url) = svc
            .upload_campaign_spec(&namespace, &raw_spec, &ids)
            .await
            .context("creating campaign spec")?;

        println!("{} Created campaign spec {}", style("✔").green(), id);
        println!("To apply it, go to: {}", url);
        Ok(())
    }
}
