//! Per-project filesystem watcher.
//!
//! One watcher per project root, batching raw notify events over the
//! configured window with the same include/exclude rules as ingestion.
//! Batches flow into the shared flush pipeline (ingestion lock → process →
//! embedding lock). Agent operations wrapping their own file edits pause
//! the watcher to avoid double ingestion, then resume.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_full::notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify_debouncer_full::notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::discovery::FileDiscovery;
use crate::edits::{EditKind, FlushHandler};
use crate::error::{Error, Result};
use crate::extract;

/// Classify one notify event into zero or more `(path, kind)` pairs.
fn classify_event(
    kind: &EventKind,
    paths: &[PathBuf],
    project_root: &Path,
    discovery: &FileDiscovery,
) -> Vec<(PathBuf, EditKind)> {
    let indexable = |abs: &Path| -> bool {
        abs.strip_prefix(project_root)
            .map(|rel| discovery.should_index(rel))
            .unwrap_or(false)
    };
    // Deleted paths cannot be stat'ed; an indexable extension is enough.
    let was_indexable = |abs: &Path| -> bool {
        abs.extension()
            .and_then(|e| e.to_str())
            .map(|ext| extract::indexable_extensions().contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
    };

    let mut out = Vec::new();
    match kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            for path in paths {
                if indexable(path) {
                    out.push((path.clone(), EditKind::Created));
                }
            }
        }
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other) => {
            for path in paths {
                if indexable(path) {
                    out.push((path.clone(), EditKind::Updated));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            if was_indexable(&paths[0]) {
                out.push((paths[0].clone(), EditKind::Deleted));
            }
            if indexable(&paths[1]) {
                out.push((paths[1].clone(), EditKind::Created));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in paths {
                if was_indexable(path) {
                    out.push((path.clone(), EditKind::Deleted));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in paths {
                if indexable(path) {
                    out.push((path.clone(), EditKind::Created));
                }
            }
        }
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            for path in paths {
                if was_indexable(path) {
                    out.push((path.clone(), EditKind::Deleted));
                }
            }
        }
        _ => {}
    }
    out
}

/// A running watcher for one project root.
pub struct ProjectWatcher {
    project_id: String,
    root: PathBuf,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ProjectWatcher {
    /// Start watching `root`, delivering debounced batches to `handler`.
    pub fn start(
        project_id: &str,
        root: &Path,
        include: &[String],
        exclude: &[String],
        batch_window_ms: u64,
        handler: FlushHandler,
    ) -> Result<Self> {
        let discovery = FileDiscovery::new(root, include, exclude)?;
        let paused = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<(PathBuf, EditKind)>>();

        let cb_root = root.to_path_buf();
        let cb_paused = Arc::clone(&paused);
        let mut debouncer = new_debouncer(
            Duration::from_millis(batch_window_ms),
            None,
            move |result: DebounceEventResult| {
                let events = match result {
                    Ok(events) => events,
                    Err(errs) => {
                        for e in errs {
                            error!("watcher debouncer error: {e}");
                        }
                        return;
                    }
                };
                if cb_paused.load(Ordering::SeqCst) {
                    return;
                }
                let mut batch: Vec<(PathBuf, EditKind)> = Vec::new();
                for event in events {
                    batch.extend(classify_event(
                        &event.event.kind,
                        &event.paths,
                        &cb_root,
                        &discovery,
                    ));
                }
                if !batch.is_empty() && tx.send(batch).is_err() {
                    debug!("watcher channel closed, dropping batch");
                }
            },
        )
        .map_err(|e| Error::Watch(format!("failed to create debouncer: {e}")))?;

        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(format!("failed to watch {}: {e}", root.display())))?;
        info!(
            project = project_id,
            root = %root.display(),
            window_ms = batch_window_ms,
            "file watcher started"
        );

        let token = cancel.clone();
        let task_project = project_id.to_string();
        let task = tokio::spawn(async move {
            // The debouncer owns the OS watch; keep it alive for the task's
            // lifetime and release it on stop.
            let _debouncer = debouncer;
            loop {
                tokio::select! {
                    Some(batch) = rx.recv() => {
                        debug!(project = %task_project, events = batch.len(), "watcher batch");
                        if let Err(e) = (handler)(batch).await {
                            error!(project = %task_project, error = %e, "watcher flush failed");
                        }
                    }
                    _ = token.cancelled() => {
                        info!(project = %task_project, "file watcher stopping");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            project_id: project_id.to_string(),
            root: root.to_path_buf(),
            paused,
            cancel,
            task,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop delivering batches without releasing the OS watch.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop cleanly, releasing the OS watch resources.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
