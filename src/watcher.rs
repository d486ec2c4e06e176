use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_RETRIES: usize = 10;

/// Something that is (re)built from files in a watched directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Background tasks polling one directory. Dropping it keeps them running;
/// call [`DirectoryWatcher::shutdown`] to stop.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watch `dir` for files accepted by `watched.is_relevant` or carrying
    /// one of `exts`. With `initial_scan` every existing match is loaded
    /// first; with `enable_retry` failed loads are retried a few times.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }
        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if matches(&*watched, &path, &exts) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means nobody is listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let keep_alive = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(?e, "Watcher error");
                        continue;
                    }
                };
                for path in event.paths.iter().filter(|p| matches(&*watched, p, &exts)) {
                    match event.kind {
                        EventKind::Create(CreateKind::Any | CreateKind::File)
                        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                            try_reload(&watched, path, enable_retry).await;
                        }
                        EventKind::Remove(_) => {
                            if let Err(e) = watched.on_remove(path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(DirectoryWatcher { handles: vec![keep_alive, dispatch] })
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn matches(watched: &dyn WatchedType, path: &Path, exts: &[String]) -> bool {
    watched.is_relevant(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| exts.iter().any(|x| x == e))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    let attempts = if retry { MAX_RETRIES } else { 1 };
    for attempt in 1..=attempts {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if attempt == attempts => {
                error!("Failed to reload {:?}: {e:?}", path);
            }
            Err(e) => {
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
