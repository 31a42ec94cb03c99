use campaigner::events::{Event, EventChannel};
use fxhash::FxHashSet;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::*;

/// Renders executor events as a progress bar plus per-repository status
/// lines. Runs until the executor reports completion.
///
pub struct StatusReporter {
    event_channel: Arc<EventChannel>,
}

impl StatusReporter {
    pub fn new(event_channel: Arc<EventChannel>) -> StatusReporter {
        StatusReporter { event_channel }
    }

    pub async fn run(self) {
        let green_bold = console::Style::new().green().bold();
        let blue_dim = console::Style::new().blue().dim();
        let red_bold = console::Style::new().red().bold();

        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>12.cyan.bold} [{bar:25}] {pos}/{len} {wide_msg}")
                .progress_chars("=> "),
        );
        pb.set_prefix("Executing");

        let consumer = self.event_channel.consumer();
        let mut current: FxHashSet<String> = FxHashSet::default();
        let mut completed = 0u64;
        let mut cache_hits = 0u64;
        let mut errored = false;

        loop {
            // NOTE: don't burn CPU cycles while the workers are busy.
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;

            consumer.fetch();
            while let Some(event) = consumer.pop() {
                trace!("{:?}", event);

                match event {
                    Event::ExecutionStarted { task_count } => {
                        pb.set_length(task_count as u64);
                    }
                    Event::ResolvingImages { count } if count > 0 => {
                        pb.println(format!(
                            "{:>12} {} container images",
                            blue_dim.apply_to("Resolving"),
                            count
                        ));
                    }
                    Event::ResolvingImages { .. } => (),
                    Event::ImageResolved { image, .. } => {
                        pb.println(format!("{:>12} {}", blue_dim.apply_to("Resolved"), image));
                    }
                    Event::TaskQueued { .. } => (),
                    Event::TaskStarted { repository } => {
                        current.insert(repository);
                    }
                    Event::ArchiveDownloading { repository } => {
                        pb.println(format!(
                            "{:>12} {}",
                            blue_dim.apply_to("Downloading"),
                            repository
                        ));
                    }
                    Event::ArchiveUnpacking { .. } => (),
                    Event::StepStarted { .. } => (),
                    Event::CacheHit { repository } => {
                        cache_hits += 1;
                        pb.println(format!(
                            "{:>12} {}",
                            blue_dim.apply_to("Cache-hit"),
                            repository
                        ));
                    }
                    Event::LogFileKept { repository, path } => {
                        pb.println(format!(
                            "{:>12} {} -> {}",
                            blue_dim.apply_to("Logging"),
                            repository,
                            path.display()
                        ));
                    }
                    Event::TaskCompleted {
                        repository,
                        changesets,
                    } => {
                        current.remove(&repository);
                        completed += 1;
                        pb.inc(1);
                        pb.println(format!(
                            "{:>12} {} ({} changesets)",
                            green_bold.apply_to("Done"),
                            repository,
                            changesets
                        ));
                    }
                    Event::TaskFailed { repository, error } => {
                        errored = true;
                        current.remove(&repository);
                        pb.inc(1);
                        pb.println(format!("{:>12} {}", red_bold.apply_to("ERROR"), repository));
                        pb.println(error);
                    }
                    Event::TaskCancelled { repository } => {
                        current.remove(&repository);
                        pb.inc(1);
                    }
                    Event::ExecutionCompleted { errored: e } => {
                        let line = format!(
                            "{:>12} {} tasks ({} cached)",
                            if errored || e {
                                red_bold.apply_to("Finished with errors")
                            } else {
                                green_bold.apply_to("Finished")
                            },
                            completed,
                            cache_hits,
                        );
                        pb.println(line);
                        pb.finish_and_clear();
                        return;
                    }
                }

                let message = current.iter().cloned().collect::<Vec<String>>().join(", ");
                pb.set_message(message);
            }
        }
    }
}
