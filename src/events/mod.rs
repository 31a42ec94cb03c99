use std::path::PathBuf;
use std::sync::Arc;

/// Everything the executor wants the outside world to know about, as it
/// happens. Producers never block; consumers drain at their own pace.
///
#[derive(Debug, Clone)]
pub enum Event {
    ExecutionStarted {
        task_count: usize,
    },
    ExecutionCompleted {
        errored: bool,
    },
    ResolvingImages {
        count: usize,
    },
    ImageResolved {
        image: String,
        digest: String,
    },
    TaskQueued {
        repository: String,
    },
    TaskStarted {
        repository: String,
    },
    CacheHit {
        repository: String,
    },
    ArchiveDownloading {
        repository: String,
    },
    ArchiveUnpacking {
        repository: String,
    },
    StepStarted {
        repository: String,
        step: usize,
        total: usize,
        run: String,
    },
    TaskCompleted {
        repository: String,
        changesets: usize,
    },
    TaskFailed {
        repository: String,
        error: String,
    },
    TaskCancelled {
        repository: String,
    },
    LogFileKept {
        repository: String,
        path: PathBuf,
    },
}

pub struct EventConsumer {
    channel: Arc<crossbeam::deque::Injector<Event>>,
    queue: crossbeam::deque::Worker<Event>,
}

impl EventConsumer {
    pub fn fetch(&self) {
        let _steal = self.channel.steal_batch(&self.queue);
    }

    pub fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        let _steal = self.channel.steal_batch(&self.queue);
        self.queue.is_empty()
    }
}

impl Iterator for &EventConsumer {
    type Item = Event;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch();
        self.pop()
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventChannel {
    bus: Arc<crossbeam::deque::Injector<Event>>,
}

impl EventChannel {
    pub fn new() -> EventChannel {
        EventChannel::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    pub fn send(&self, event: Event) {
        self.bus.push(event)
    }

    pub fn consumer(&self) -> EventConsumer {
        EventConsumer {
            channel: self.bus.clone(),
            queue: crossbeam::deque::Worker::new_fifo(),
        }
    }
}
