//! Hook families a plugin can implement, plus the context handed to the
//! long-running ones.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::ConfigView;
use crate::device::Device;
use crate::error::{Result, SpreadsError};
use crate::metadata::Metadata;
use crate::page::Page;
use crate::workflow::CancellationToken;

/// Runs around every capture session.
pub trait CaptureHook: Send + Sync {
    fn prepare_capture(&self, _devices: &[Arc<dyn Device>]) -> Result<()> {
        Ok(())
    }

    /// Called with the pages of one shot once they are persisted.
    fn capture(&self, _pages: &[Page]) -> Result<()> {
        Ok(())
    }

    fn finish_capture(&self, _devices: &[Arc<dyn Device>]) -> Result<()> {
        Ok(())
    }
}

/// Produces capture requests from an external stimulus (pedal, timer).
///
/// The plugin owns its thread. It must stop producing once the handle's
/// shutdown channel is closed, and `stop_trigger_loop` joins the thread.
pub trait TriggerHook: Send + Sync {
    fn start_trigger_loop(&self, handle: TriggerHandle) -> Result<()>;

    fn stop_trigger_loop(&self) -> Result<()>;
}

/// Writes derivatives below `target_path` and records them on the pages
/// with [`Page::set_processed`].
pub trait ProcessHook: Send + Sync {
    fn process(&self, pages: &mut [Page], target_path: &Path, ctx: &StepContext) -> Result<()>;
}

/// Writes output artifacts below `out_path` and returns their paths.
pub trait OutputHook: Send + Sync {
    fn output(
        &self,
        pages: &[Page],
        out_path: &Path,
        metadata: &Metadata,
        target: Option<&str>,
        ctx: &StepContext,
    ) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub at: Instant,
}

/// Producer side of the engine's trigger queue.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    triggers: Sender<TriggerEvent>,
    shutdown: Receiver<()>,
}

impl TriggerHandle {
    pub fn new(triggers: Sender<TriggerEvent>, shutdown: Receiver<()>) -> Self {
        Self { triggers, shutdown }
    }

    /// Queues one capture request. A full queue drops the request instead of
    /// blocking the plugin thread; returns whether it was queued.
    pub fn trigger(&self) -> bool {
        match self.triggers.try_send(TriggerEvent { at: Instant::now() }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Trigger queue full, dropping request");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Waits up to `timeout` for shutdown. Returns true once the engine has
    /// closed the shutdown channel.
    pub fn wait_for_shutdown(&self, timeout: std::time::Duration) -> bool {
        match self.shutdown.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.wait_for_shutdown(std::time::Duration::ZERO)
    }
}

/// Receives plugin-local progress in `[0, 1]`.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, fraction: f64);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _fraction: f64) {}
}

/// Per-plugin context of a process or output step.
///
/// Every progress report is also a cancellation check: once the workflow is
/// cancelled, `report` and `page_done` return [`SpreadsError::Cancelled`].
pub struct StepContext {
    root: PathBuf,
    config: ConfigView,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
    total_pages: usize,
    pages_done: AtomicUsize,
}

impl StepContext {
    pub fn new(
        root: &Path,
        config: ConfigView,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressReporter>,
        total_pages: usize,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            cancel,
            progress,
            total_pages,
            pages_done: AtomicUsize::new(0),
        }
    }

    /// Configuration scoped to the running plugin.
    pub fn config(&self) -> &ConfigView {
        &self.config
    }

    /// Absolute path of a bag-relative path such as `page.raw_image`.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Bag-relative form of a path below the workflow root.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SpreadsError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report(&self, fraction: f64) -> Result<()> {
        self.check_cancelled()?;
        self.progress.report(fraction.clamp(0.0, 1.0));
        Ok(())
    }

    /// Linear progress for plugins that work page by page.
    pub fn page_done(&self) -> Result<()> {
        let done = self.pages_done.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total_pages.max(1);
        self.report(done.min(total) as f64 / total as f64)
    }

    pub fn pages_done(&self) -> usize {
        self.pages_done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder(Mutex<Vec<f64>>);

    impl ProgressReporter for Recorder {
        fn report(&self, fraction: f64) {
            self.0.lock().push(fraction);
        }
    }

    fn context(total: usize) -> (StepContext, Arc<Recorder>, CancellationToken) {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();
        let ctx = StepContext::new(
            Path::new("/scans/book"),
            ConfigView::from_value("crop", serde_json::json!({})),
            cancel.clone(),
            recorder.clone(),
            total,
        );
        (ctx, recorder, cancel)
    }

    #[test]
    fn test_page_done_reports_linear_progress() {
        let (ctx, recorder, _) = context(4);
        for _ in 0..4 {
            ctx.page_done().unwrap();
        }
        assert_eq!(*recorder.0.lock(), vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_report_is_a_cancellation_point() {
        let (ctx, recorder, cancel) = context(2);
        ctx.report(0.5).unwrap();
        cancel.cancel();
        assert!(matches!(ctx.report(0.7), Err(SpreadsError::Cancelled)));
        assert!(matches!(ctx.page_done(), Err(SpreadsError::Cancelled)));
        assert_eq!(*recorder.0.lock(), vec![0.5]);
    }

    #[test]
    fn test_paths_resolve_against_root() {
        let (ctx, _, _) = context(1);
        assert_eq!(
            ctx.resolve("data/raw/000.jpg"),
            PathBuf::from("/scans/book/data/raw/000.jpg")
        );
        assert_eq!(
            ctx.relative(Path::new("/scans/book/data/done/crop/000.jpg")),
            "data/done/crop/000.jpg"
        );
    }

    #[test]
    fn test_trigger_handle_never_blocks() {
        let (tx, rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let handle = TriggerHandle::new(tx, shutdown_rx);

        assert!(handle.trigger());
        assert!(!handle.trigger());
        assert_eq!(rx.len(), 1);

        assert!(!handle.wait_for_shutdown(Duration::from_millis(5)));
        drop(shutdown_tx);
        assert!(handle.is_shut_down());
    }
}
