//! A scanning workflow: one bag on disk plus the capture session and
//! pipeline steps that mutate it.
//!
//! Every mutating operation takes the workflow's re-entrant lock. Inner
//! locks guard individual fields and are never held across hook, driver or
//! bus calls.

pub mod cancel;
mod capture;
pub mod lockfile;
pub mod numbering;
mod pipeline;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use log::{debug, info, warn};
use moka::sync::Cache;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bag::{Algorithm, Bag, FetchMapping, TarCompression, DATA_DIR};
use crate::config::Configuration;
use crate::device::Device;
use crate::error::{BagError, ConfigError, Result, SpreadsError, ValidationError, WorkflowError};
use crate::events::{EventBus, Payload, Signal};
use crate::metadata::Metadata;
use crate::page::{self, Page};
use crate::plugin::{PluginInstance, PluginRegistry};

pub use cancel::CancellationToken;
pub use lockfile::{LockFile, LOCK_FILE};
pub use state::{Action, Phase, Status, Step, WorkflowState};

/// Workflow configuration overlay, stored as a tag file.
pub const CONFIG_JSON: &str = "config.json";
/// `bag-info.txt` tag holding the workflow UUID.
pub const ID_TAG: &str = "External-Identifier";
/// Checksum algorithms of newly created workflows.
pub const ALGORITHMS: [Algorithm; 2] = [Algorithm::Md5, Algorithm::Sha256];

const THUMBNAIL_SIZE: u32 = 320;
const THUMBNAIL_CACHE: u64 = 512;

/// Shared by every workflow an engine opens.
pub(crate) struct WorkflowServices {
    pub bus: Arc<EventBus>,
    pub registry: Arc<PluginRegistry>,
    pub app_config: Configuration,
    /// The workflow currently holding the devices, if any.
    pub prepared: Mutex<Option<Weak<Workflow>>>,
}

/// Devices and plugins held between `prepare_capture` and `finish_capture`.
struct CaptureSession {
    devices: Vec<Arc<dyn Device>>,
    plugins: Vec<PluginInstance>,
    /// Dropping it closes the trigger shutdown channel.
    shutdown: Option<Sender<()>>,
}

impl CaptureSession {
    fn stop_triggers(&mut self) -> Vec<SpreadsError> {
        drop(self.shutdown.take());
        self.plugins
            .iter()
            .filter_map(|p| p.trigger().map(|t| (p.name(), t)))
            .filter_map(|(name, trigger)| match trigger.stop_trigger_loop() {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to stop trigger loop of '{}': {}", name, e);
                    Some(e)
                }
            })
            .collect()
    }
}

/// Serializable view of a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub status: Status,
    pub capture_start: Option<i64>,
    pub pages: Vec<Page>,
    pub config: Value,
    pub metadata: Metadata,
    pub out_files: Vec<String>,
}

pub struct Workflow {
    id: Uuid,
    me: Weak<Workflow>,
    lock: ReentrantMutex<()>,
    path: RwLock<PathBuf>,
    state: RwLock<WorkflowState>,
    bag: Mutex<Bag>,
    pages: RwLock<Vec<Page>>,
    config: RwLock<Configuration>,
    metadata: RwLock<Metadata>,
    out_files: RwLock<Vec<String>>,
    session: Mutex<Option<CaptureSession>>,
    last_shot: Mutex<Vec<u32>>,
    cancel: CancellationToken,
    thumbnails: Cache<u32, Arc<Vec<u8>>>,
    lockfile: Mutex<Option<LockFile>>,
    services: Arc<WorkflowServices>,
}

impl Workflow {
    /// Creates the bag at `path` and persists the overlay and metadata.
    pub(crate) fn create(
        path: &Path,
        overlay: Value,
        metadata: Metadata,
        services: Arc<WorkflowServices>,
    ) -> Result<Arc<Self>> {
        let id = Uuid::new_v4();
        let mut bag = Bag::create(path, &ALGORITHMS)?;
        bag.set_info(ID_TAG, &id.to_string());
        bag.save()?;

        let mut config = services.app_config.for_workflow(json!({}));
        if overlay.is_object() {
            config.update(&overlay)?;
        }
        write_overlay(&mut bag, config.overlay())?;
        metadata.save(&mut bag)?;

        let lock = LockFile::acquire(path)?;
        info!("Created workflow {} at {}", id, path.display());
        Ok(Self::assemble(id, bag, Vec::new(), config, metadata, lock, services))
    }

    /// Opens an existing bag.
    pub(crate) fn open(bag: Bag, services: Arc<WorkflowServices>) -> Result<Arc<Self>> {
        let id = read_id(&bag)?;
        let lock = LockFile::acquire(bag.path())?;
        let pages = page::load_pages(&bag)?;
        let metadata = Metadata::load(&bag)?;
        let overlay = match bag.read_tagfile(CONFIG_JSON)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(ConfigError::from)?,
            None => json!({}),
        };
        let config = services.app_config.for_workflow(overlay);
        debug!(
            "Opened workflow {} at {} ({} pages)",
            id,
            bag.path().display(),
            pages.len()
        );
        Ok(Self::assemble(id, bag, pages, config, metadata, lock, services))
    }

    fn assemble(
        id: Uuid,
        bag: Bag,
        pages: Vec<Page>,
        config: Configuration,
        metadata: Metadata,
        lock: LockFile,
        services: Arc<WorkflowServices>,
    ) -> Arc<Self> {
        let out_files = bag
            .payload_files()
            .into_iter()
            .filter(|f| f.starts_with("data/out/"))
            .collect();
        Arc::new_cyclic(|me| Workflow {
            id,
            me: me.clone(),
            lock: ReentrantMutex::new(()),
            path: RwLock::new(bag.path().to_path_buf()),
            state: RwLock::new(WorkflowState::default()),
            bag: Mutex::new(bag),
            pages: RwLock::new(pages),
            config: RwLock::new(config),
            metadata: RwLock::new(metadata),
            out_files: RwLock::new(out_files),
            session: Mutex::new(None),
            last_shot: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            thumbnails: Cache::new(THUMBNAIL_CACHE),
            lockfile: Mutex::new(Some(lock)),
            services,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Directory name of the workflow.
    pub fn name(&self) -> String {
        self.path
            .read()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn status(&self) -> Status {
        self.state.read().status
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase()
    }

    pub fn is_prepared(&self) -> bool {
        self.state.read().status.prepared
    }

    pub fn capture_start(&self) -> Option<i64> {
        self.state.read().capture_start
    }

    pub fn pages(&self) -> Vec<Page> {
        self.pages.read().clone()
    }

    pub fn page(&self, capture_num: u32) -> Option<Page> {
        self.pages
            .read()
            .iter()
            .find(|p| p.capture_num == capture_num)
            .cloned()
    }

    pub fn config(&self) -> Configuration {
        self.config.read().clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    pub fn out_files(&self) -> Vec<String> {
        self.out_files.read().clone()
    }

    /// Devices of the running capture session.
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.devices.clone())
            .unwrap_or_default()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.state.read().clone();
        WorkflowSnapshot {
            id: self.id,
            name: self.name(),
            path: self.path(),
            status: state.status,
            capture_start: state.capture_start,
            pages: self.pages(),
            config: self.config.read().overlay().clone(),
            metadata: self.metadata(),
            out_files: self.out_files(),
        }
    }

    fn emit(&self, signal: Signal, payload: Payload) {
        self.services.bus.send(signal, &self.id.to_string(), payload);
    }

    pub(crate) fn emit_modified(&self, changes: Value) {
        self.emit(Signal::WorkflowModified, crate::payload!("changes" => changes));
    }

    /// Persists `pages` and only then swaps them in.
    fn commit_pages(&self, mut pages: Vec<Page>) -> Result<()> {
        numbering::renumber(&mut pages);
        page::save_pages(&mut self.bag.lock(), &pages)?;
        *self.pages.write() = pages;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SpreadsError::Cancelled);
        }
        Ok(())
    }

    /// Requests cooperative cancellation of the running step or shot.
    /// Returns false when there is nothing to cancel.
    pub fn cancel(&self) -> bool {
        let state = self.state.read();
        if !(state.busy || state.status.prepared) {
            return false;
        }
        info!("Cancelling {} of workflow {}", state.phase(), self.id);
        self.cancel.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deep-merges `changes` into the overlay, persists it and notifies
    /// the devices of the running session. Returns the changed leaves.
    pub fn update_configuration(&self, changes: &Value) -> Result<Value> {
        let _guard = self.lock.lock();
        let mut next = self.config.read().clone();
        let diff = next.update(changes)?;
        write_overlay(&mut self.bag.lock(), next.overlay())?;
        *self.config.write() = next;

        if diff.as_object().is_some_and(|d| d.is_empty()) {
            return Ok(diff);
        }
        self.emit_modified(json!({ "config": diff }));
        for device in self.devices() {
            if let Err(e) = device.update_configuration(&diff) {
                warn!("Device {} rejected configuration change: {}", device.id(), e);
            }
        }
        Ok(diff)
    }

    pub fn update_metadata(&self, changes: &Value) -> Result<Metadata> {
        let _guard = self.lock.lock();
        let next = self.metadata.read().merged(changes)?;
        next.save(&mut self.bag.lock())?;
        *self.metadata.write() = next.clone();
        self.emit_modified(json!({ "metadata": next }));
        Ok(next)
    }

    /// Sets `page_label` or `is_blank` on one page.
    pub fn set_page_metadata(&self, capture_num: u32, key: &str, value: &Value) -> Result<Page> {
        let _guard = self.lock.lock();
        let mut pages = self.pages();
        let page = pages
            .iter_mut()
            .find(|p| p.capture_num == capture_num)
            .ok_or(WorkflowError::UnknownPage(capture_num))?;
        page.set_metadata(key, value)?;
        let updated = page.clone();
        self.commit_pages(pages)?;
        self.emit_modified(json!({ "pages": [updated] }));
        Ok(updated)
    }

    /// Crops the raw image of one page. Derivatives are stale afterwards and
    /// get deleted.
    pub fn crop_page(&self, capture_num: u32, left: u32, top: u32, width: u32, height: u32) -> Result<Page> {
        let _guard = self.lock.lock();
        let mut pages = self.pages();
        let idx = pages
            .iter()
            .position(|p| p.capture_num == capture_num)
            .ok_or(WorkflowError::UnknownPage(capture_num))?;

        let raw = self.path().join(&pages[idx].raw_image);
        page::crop_image(&raw, left, top, width, height)?;

        let stale: Vec<String> = pages[idx].processed_images.paths().map(str::to_string).collect();
        {
            let mut bag = self.bag.lock();
            if !stale.is_empty() {
                bag.remove_payload(&stale)?;
            }
            bag.add_payload(&[&raw])?;
        }
        pages[idx].processed_images.clear();
        let cropped = pages[idx].clone();
        self.commit_pages(pages)?;
        self.thumbnails.invalidate(&capture_num);

        debug!("Cropped page {} to {}x{}+{}+{}", capture_num, width, height, left, top);
        self.emit_modified(json!({ "pages": [cropped] }));
        Ok(cropped)
    }

    /// Deletes pages and their files. Remaining capture numbers are kept.
    pub fn remove_pages(&self, remove: &[Page]) -> Result<()> {
        let _guard = self.lock.lock();
        let pages = self.pages();
        let foreign: Vec<String> = remove
            .iter()
            .filter(|r| {
                !pages
                    .iter()
                    .any(|p| p.capture_num == r.capture_num && p.raw_image == r.raw_image)
            })
            .map(|r| r.capture_num.to_string())
            .collect();
        if !foreign.is_empty() {
            return Err(ValidationError::new("cannot remove pages")
                .with_field(
                    "pages",
                    format!("page(s) {} do not belong to this workflow", foreign.join(", ")),
                )
                .into());
        }

        let doomed: Vec<u32> = remove.iter().map(|p| p.capture_num).collect();
        let files: Vec<String> = pages
            .iter()
            .filter(|p| doomed.contains(&p.capture_num))
            .flat_map(|p| p.files().into_iter().map(str::to_string))
            .collect();
        self.bag.lock().remove_payload(&files)?;

        let kept: Vec<Page> = pages
            .into_iter()
            .filter(|p| !doomed.contains(&p.capture_num))
            .collect();
        self.commit_pages(kept)?;
        self.last_shot.lock().retain(|n| !doomed.contains(n));
        for num in &doomed {
            self.thumbnails.invalidate(num);
        }

        info!("Removed {} page(s) from workflow {}", doomed.len(), self.id);
        self.emit_modified(json!({ "removed_pages": doomed, "pages": self.pages() }));
        Ok(())
    }

    /// Puts the pages in the order of `capture_nums`, which must list every
    /// page exactly once.
    pub fn reorder_pages(&self, capture_nums: &[u32]) -> Result<()> {
        let _guard = self.lock.lock();
        let mut pages = self.pages();
        let mut wanted = capture_nums.to_vec();
        wanted.sort_unstable();
        let mut have: Vec<u32> = pages.iter().map(|p| p.capture_num).collect();
        have.sort_unstable();
        if wanted != have {
            return Err(ValidationError::new("cannot reorder pages")
                .with_field("pages", "order must list every capture number exactly once")
                .into());
        }

        pages.sort_by_key(|p| capture_nums.iter().position(|n| *n == p.capture_num));
        self.commit_pages(pages)?;
        self.emit_modified(json!({ "pages": self.pages() }));
        Ok(())
    }

    /// Renames the workflow directory.
    pub fn rename(&self, name: &str) -> Result<PathBuf> {
        let _guard = self.lock.lock();
        self.state.read().check(Action::Rename)?;
        let dirname = crate::sanitize::workflow_dirname(name).ok_or_else(|| {
            ValidationError::new("invalid workflow name").with_field("name", "must not be empty")
        })?;

        let old = self.path();
        let parent = old.parent().map(Path::to_path_buf).unwrap_or_default();
        let new = parent.join(&dirname);
        if new == old {
            return Ok(new);
        }
        if new.exists() {
            return Err(ValidationError::new("invalid workflow name")
                .with_field("name", format!("'{}' already exists", dirname))
                .into());
        }

        self.lockfile.lock().take();
        if let Err(e) = std::fs::rename(&old, &new) {
            *self.lockfile.lock() = Some(LockFile::acquire(&old)?);
            return Err(SpreadsError::io(&new, e));
        }
        let bag = Bag::open(&new)?;
        *self.bag.lock() = bag;
        *self.path.write() = new.clone();
        *self.lockfile.lock() = Some(LockFile::acquire(&new)?);

        info!("Renamed workflow {} to '{}'", self.id, dirname);
        self.emit_modified(json!({ "name": dirname }));
        Ok(new)
    }

    /// JPEG thumbnail of the best available image of a page.
    pub fn get_thumbnail(&self, capture_num: u32) -> Result<Arc<Vec<u8>>> {
        if let Some(thumb) = self.thumbnails.get(&capture_num) {
            return Ok(thumb);
        }
        let page = self
            .page(capture_num)
            .ok_or(WorkflowError::UnknownPage(capture_num))?;
        let source = page
            .get_latest_processed(true)
            .unwrap_or(page.raw_image.as_str());
        let thumb = Arc::new(page::render_thumbnail(
            &self.path().join(source),
            THUMBNAIL_SIZE,
        )?);
        self.thumbnails.insert(capture_num, Arc::clone(&thumb));
        Ok(thumb)
    }

    /// Checks the bag; `fast` skips digest recomputation.
    pub fn validate(&self, fast: bool) -> Result<()> {
        Ok(self.bag.lock().validate(fast)?)
    }

    pub fn package_as_zip(&self, dest: &Path) -> Result<()> {
        let _guard = self.lock.lock();
        Ok(self.bag.lock().package_as_zip(dest, &FetchMapping::new())?)
    }

    pub fn package_as_tar(&self, dest: &Path, compression: TarCompression) -> Result<()> {
        let _guard = self.lock.lock();
        Ok(self
            .bag
            .lock()
            .package_as_tar(dest, compression, &FetchMapping::new())?)
    }

    /// Finishes a running capture, releases the lock file and deletes the
    /// directory.
    pub(crate) fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock();
        if self.is_prepared() {
            if let Err(e) = self.finish_capture() {
                warn!("Errors while finishing capture of removed workflow {}: {}", self.id, e);
            }
        }
        let path = self.path();
        self.lockfile.lock().take();
        std::fs::remove_dir_all(&path).map_err(|e| SpreadsError::io(&path, e))?;
        info!("Removed workflow {} at {}", self.id, path.display());
        Ok(())
    }

    fn data_path(&self, sub: &str) -> PathBuf {
        self.path().join(DATA_DIR).join(sub)
    }
}

impl Drop for Workflow {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.get_mut().take() {
            debug!("Stopping orphaned capture session of workflow {}", self.id);
            session.stop_triggers();
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("phase", &self.phase())
            .finish()
    }
}

/// UUID stored in `bag-info.txt`.
pub(crate) fn read_id(bag: &Bag) -> Result<Uuid> {
    let raw = bag.info(ID_TAG).ok_or_else(|| {
        BagError::Structure(format!("bag-info.txt lacks {}", ID_TAG))
    })?;
    Uuid::parse_str(raw).map_err(|e| {
        BagError::Structure(format!("invalid {} '{}': {}", ID_TAG, raw, e)).into()
    })
}

fn write_overlay(bag: &mut Bag, overlay: &Value) -> Result<()> {
    let json = serde_json::to_vec_pretty(overlay).map_err(ConfigError::from)?;
    Ok(bag.write_tagfile(CONFIG_JSON, &json)?)
}
