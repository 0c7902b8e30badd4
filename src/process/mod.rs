//! Image identification and thumbnailing.
//!
//! Identification runs on a bounded pool but blocks the caller, because
//! ingestion can't go on without dimensions. Thumbnails are fire-and-forget
//! jobs on a second pool; their failures are logged and dropped.

mod magick;
mod tool;

pub use magick::{parse_identify_verbose, MagickTool};
pub use tool::{BuiltinTool, PictureInfo, PictureTool};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{ImageTool, PictureBankConfig};
use crate::error::ProcessError;

pub fn tool_for(kind: ImageTool) -> Arc<dyn PictureTool> {
    match kind {
        ImageTool::Builtin => Arc::new(BuiltinTool::new()),
        ImageTool::Magick => Arc::new(MagickTool::new()),
    }
}

#[derive(Default)]
struct JobState {
    in_flight: usize,
    shut_down: bool,
}

/// Pending thumbnail jobs, shared with the pool threads.
#[derive(Default)]
struct Jobs {
    state: Mutex<JobState>,
    idle: Condvar,
}

impl Jobs {
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut state = self.lock();
        while state.in_flight > 0 {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub struct ImageProcessor {
    tool: Arc<dyn PictureTool>,
    identify_pool: ThreadPool,
    work_pool: ThreadPool,
    jobs: Arc<Jobs>,
    thumbnail_size: u32,
}

fn build_pool(bank_id: u32, kind: &'static str, threads: usize) -> Result<ThreadPool, ProcessError> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("picbank-{kind}-{bank_id}-{i}"))
        .build()
        .map_err(|e| ProcessError::Execution(e.to_string()))
}

impl ImageProcessor {
    pub fn new(config: &PictureBankConfig) -> Result<Self, ProcessError> {
        Self::with_tool(config, tool_for(config.image_tool))
    }

    pub fn with_tool(
        config: &PictureBankConfig,
        tool: Arc<dyn PictureTool>,
    ) -> Result<Self, ProcessError> {
        let bank_id = config.picture_bank_id;
        Ok(Self {
            tool,
            identify_pool: build_pool(bank_id, "identify", config.max_concurrent_identify)?,
            work_pool: build_pool(bank_id, "work", config.max_concurrent_other)?,
            jobs: Arc::new(Jobs::default()),
            thumbnail_size: config.thumbnail_size,
        })
    }

    pub fn tool_name(&self) -> &'static str {
        self.tool.name()
    }

    /// Identify `path` on the identify pool, blocking until it is done.
    pub fn identify(&self, path: &Path) -> Result<PictureInfo, ProcessError> {
        if self.jobs.lock().shut_down {
            return Err(ProcessError::Shutdown);
        }
        let tool = &self.tool;
        self.identify_pool.install(|| tool.identify(path))
    }

    /// Queue a thumbnail of `src` into `dest`. Nothing happens when `dest`
    /// already exists.
    pub fn create_thumbnail(&self, src: PathBuf, dest: PathBuf) -> Result<(), ProcessError> {
        {
            let mut state = self.jobs.lock();
            if state.shut_down {
                return Err(ProcessError::Shutdown);
            }
            if dest.exists() {
                return Ok(());
            }
            state.in_flight += 1;
        }

        let tool = Arc::clone(&self.tool);
        let jobs = Arc::clone(&self.jobs);
        let max_side = self.thumbnail_size;
        self.work_pool.spawn(move || {
            // Another job for the same picture may have finished meanwhile
            if !dest.exists() {
                match tool.thumbnail(&src, &dest, max_side) {
                    Ok(()) => tracing::debug!(thumbnail = %dest.display(), "Created thumbnail"),
                    Err(e) => tracing::warn!(
                        source = %src.display(),
                        error = %e,
                        "Thumbnail creation failed"
                    ),
                }
            }
            jobs.finish();
        });
        Ok(())
    }

    /// Block until no thumbnail job is pending.
    pub fn wait_idle(&self) {
        self.jobs.wait_idle();
    }

    /// Refuse new work and wait for the queued thumbnails to complete.
    pub fn shutdown(&self) {
        self.jobs.lock().shut_down = true;
        self.jobs.wait_idle();
    }

    pub fn is_shut_down(&self) -> bool {
        self.jobs.lock().shut_down
    }
}
