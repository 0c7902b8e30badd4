//! A single picture bank: one SQLite file, one picture tree, one index.
//!
//! Pictures are stored under their content hash, so the same bytes can only
//! enter a bank once. Ingestion writes the file, the SQL row and the index
//! document, undoing the earlier steps if a later one fails. Edits go through
//! cached [`Picture`] handles and reach SQL and the index later, through the
//! bank's update worker.

mod browser;
mod cache;
mod picture;
pub mod random;
mod updater;

pub use browser::{Browser, PictureSource};
pub use picture::{Picture, PictureRecord, MAX_GRADE};
pub use updater::UpdateStats;

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;

use cache::PictureCache;
use picture::{now_millis, WriteBack};
use updater::{spawn_worker, Persister, UpdateQueue};

use crate::config::PictureBankConfig;
use crate::db::Database;
use crate::error::{AddError, AddErrorKind, BankError, DbError, IndexError, PictureError};
use crate::events::{BankEvent, EventBus, SubscriberId};
use crate::index::{Indexer, PictureQuery};
use crate::process::{tool_for, ImageProcessor, PictureTool};
use crate::scanner::{discover_files, hash_file};
use crate::tags::{Tag, TagId, TagRepository};

/// Two-hex-digit bucket of a picture id.
fn bucket(id: &str) -> &str {
    id.get(..2).unwrap_or("00")
}

fn bucket_names() -> impl Iterator<Item = String> {
    (0..=255u8).map(|b| format!("{:02X}", b))
}

/// Outcome of a directory import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddResult {
    /// Ids of the pictures ingested, in traversal order.
    pub added: Vec<String>,
    pub failed: Vec<(PathBuf, AddErrorKind)>,
}

impl AddResult {
    pub fn ok(&self) -> usize {
        self.added.len()
    }

    pub fn failure_count(&self, kind: AddErrorKind) -> usize {
        self.failed.iter().filter(|(_, k)| *k == kind).count()
    }

    pub fn failures_by_kind(&self) -> BTreeMap<AddErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for (_, kind) in &self.failed {
            *counts.entry(*kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn failed_paths(&self) -> impl Iterator<Item = &Path> {
        self.failed.iter().map(|(path, _)| path.as_path())
    }
}

/// Ids known to the bank, plus the ones being ingested right now.
#[derive(Default)]
struct Membership {
    ids: Vec<String>,
    known: HashSet<String>,
    reserved: HashSet<String>,
}

/// Claim on an id during ingestion. Released on drop.
struct Reservation<'a> {
    membership: &'a Mutex<Membership>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.membership).reserved.remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct BankCore {
    config: PictureBankConfig,
    db: Arc<Database>,
    indexer: Arc<Indexer>,
    tags: Arc<TagRepository>,
    processor: ImageProcessor,
    cache: Arc<PictureCache>,
    updates: Arc<UpdateQueue>,
    persister: Arc<Persister>,
    membership: Mutex<Membership>,
    bus: Arc<EventBus>,
    span: tracing::Span,
    closed: AtomicBool,
}

impl BankCore {
    fn bank_id(&self) -> u32 {
        self.config.picture_bank_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn contains(&self, id: &str) -> bool {
        lock(&self.membership).known.contains(id)
    }

    fn picture(&self, id: &str) -> Result<Picture, BankError> {
        if self.is_closed() {
            return Err(BankError::Closed(self.bank_id()));
        }
        if !self.contains(id) {
            return Err(BankError::UnknownPicture(id.to_string()));
        }
        self.cache.get_or_load(id, || -> Result<Picture, BankError> {
            match self.db.load_picture(id)? {
                Some(record) => Ok(Picture::new(record, Arc::clone(&self.updates))),
                None => Err(BankError::UnknownPicture(id.to_string())),
            }
        })
    }

    /// Current state of a picture: the cached one if loaded, else the stored.
    fn current_record(&self, id: &str) -> Result<Option<PictureRecord>, DbError> {
        match self.cache.get_if_present(id) {
            Some(picture) => Ok(Some(picture.record())),
            None => self.db.load_picture(id),
        }
    }
}

impl PictureSource for BankCore {
    fn bank_id(&self) -> u32 {
        BankCore::bank_id(self)
    }

    fn load(&self, id: &str) -> Result<Picture, BankError> {
        self.picture(id)
    }
}

/// An open picture bank.
///
/// Dropping the bank closes it.
pub struct PictureBank {
    core: Arc<BankCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PictureBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PictureBank")
            .field("id", &self.core.bank_id())
            .field("name", &self.core.config.name)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

fn create_dir(path: &Path) -> Result<(), BankError> {
    fs::create_dir_all(path).map_err(|source| BankError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

impl PictureBank {
    /// Open the bank described by `config`, creating whatever is missing.
    pub fn open(config: PictureBankConfig, bus: Arc<EventBus>) -> Result<Self, BankError> {
        let tool = tool_for(config.image_tool);
        Self::open_with_tool(config, bus, tool)
    }

    /// Open with an explicit identify/thumbnail tool.
    pub fn open_with_tool(
        config: PictureBankConfig,
        bus: Arc<EventBus>,
        tool: Arc<dyn PictureTool>,
    ) -> Result<Self, BankError> {
        let bank_id = config.picture_bank_id;
        let span = tracing::info_span!("picture_bank", id = bank_id);
        let _enter = span.enter();

        for root in [&config.picture_root, &config.thumbnail_root] {
            create_dir(root)?;
            for name in bucket_names() {
                create_dir(&root.join(name))?;
            }
        }
        create_dir(&config.index_dir)?;
        if let Some(parent) = config.db_path.parent() {
            create_dir(parent)?;
        }

        let db = Arc::new(Database::open(&config.db_path)?);
        let indexer = Arc::new(Indexer::open(&config.index_dir)?);
        let tags = Arc::new(TagRepository::load(bank_id, Arc::clone(&db), Arc::clone(&bus))?);

        let ids = db.select_all_picture_ids()?;
        let membership = Membership {
            known: ids.iter().cloned().collect(),
            ids,
            reserved: HashSet::new(),
        };

        let processor = ImageProcessor::with_tool(&config, tool)?;
        let delay_ms = i64::try_from(config.write_delay().as_millis()).unwrap_or(i64::MAX);
        let updates = Arc::new(UpdateQueue::new(delay_ms));
        let persister = Arc::new(Persister::new(
            bank_id,
            Arc::clone(&db),
            Arc::clone(&indexer),
            Arc::clone(&tags),
        ));
        let cache = {
            let persister = Arc::clone(&persister);
            Arc::new(PictureCache::new(move |picture: &Picture| {
                persister.write_back(picture, None);
            }))
        };

        let worker = spawn_worker(
            bank_id,
            Arc::clone(&updates),
            Arc::clone(&cache),
            Arc::clone(&persister),
            span.clone(),
        )
        .map_err(crate::error::ProcessError::Io)?;

        tracing::info!(
            name = %config.name,
            pictures = membership.ids.len(),
            tool = processor.tool_name(),
            "Opened picture bank"
        );

        let core = Arc::new(BankCore {
            config,
            db,
            indexer,
            tags,
            processor,
            cache,
            updates,
            persister,
            membership: Mutex::new(membership),
            bus,
            span: span.clone(),
            closed: AtomicBool::new(false),
        });

        Ok(Self {
            core,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> u32 {
        self.core.bank_id()
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn config(&self) -> &PictureBankConfig {
        &self.core.config
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Where the picture with `id` is stored.
    pub fn picture_path(&self, id: &str) -> PathBuf {
        self.core.config.picture_root.join(bucket(id)).join(id)
    }

    pub fn thumbnail_path(&self, id: &str) -> PathBuf {
        self.core.config.thumbnail_root.join(bucket(id)).join(id)
    }

    /// Observe the events published by this bank and its tag repository.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<BankEvent>) {
        self.core.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.core.bus.unsubscribe(id)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Ingest the file at `path` and return the new picture's id.
    pub fn add_picture(&self, path: &Path) -> Result<String, AddError> {
        let _enter = self.core.span.enter();
        if self.core.is_closed() {
            return Err(AddError::Closed(self.id()));
        }

        let metadata = fs::metadata(path).map_err(|_| match fs::symlink_metadata(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                AddError::FileNotFound(path.to_path_buf())
            }
            _ => AddError::CantRead(path.to_path_buf()),
        })?;
        if !metadata.is_file() {
            return Err(AddError::NotAFile(path.to_path_buf()));
        }

        let id = hash_file(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AddError::FileNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => AddError::CantRead(path.to_path_buf()),
            _ => AddError::IoError {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        let reservation = self.reserve(&id)?;
        let record = self.store_picture(path, &id)?;

        {
            let mut membership = lock(&self.core.membership);
            membership.ids.push(id.clone());
            membership.known.insert(id.clone());
        }
        drop(reservation);

        self.core
            .cache
            .insert(Picture::new(record, Arc::clone(&self.core.updates)));
        if let Err(e) = self.create_thumbnail(&id) {
            tracing::warn!(picture_id = %id, error = %e, "Thumbnail not queued");
        }

        tracing::info!(picture_id = %id, source = %path.display(), "Added picture");
        self.core.bus.publish(BankEvent::PictureAdded {
            bank_id: self.id(),
            picture_id: id.clone(),
        });
        Ok(id)
    }

    /// Claim `id` for ingestion, failing if it is known or being ingested.
    fn reserve(&self, id: &str) -> Result<Reservation<'_>, AddError> {
        let mut membership = lock(&self.core.membership);
        if membership.known.contains(id) || !membership.reserved.insert(id.to_string()) {
            return Err(AddError::FileAlreadyExists { id: id.to_string() });
        }
        Ok(Reservation {
            membership: &self.core.membership,
            id: id.to_string(),
        })
    }

    /// Identify, copy, insert and index. Leaves nothing behind on failure.
    fn store_picture(&self, path: &Path, id: &str) -> Result<PictureRecord, AddError> {
        let info = self
            .core
            .processor
            .identify(path)
            .map_err(|source| AddError::IdentifyExecutionError {
                id: id.to_string(),
                source,
            })?;

        let destination = self.picture_path(id);
        copy_new(path, &destination).map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                AddError::FileAlreadyExists { id: id.to_string() }
            } else {
                AddError::CopyError {
                    id: id.to_string(),
                    source,
                }
            }
        })?;

        let now = now_millis();
        let record = PictureRecord {
            id: id.to_string(),
            original_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            width: info.width,
            height: info.height,
            added_ts: now,
            creation_ts: now,
            modified_ts: now,
            grade: 0,
            tags: Default::default(),
        };

        if let Err(source) = self.core.db.insert_picture(&record, &destination) {
            self.discard_file(id, &destination);
            return Err(AddError::SqlInsertError {
                id: id.to_string(),
                source,
            });
        }

        if let Err(source) = self.core.indexer.index_picture(&record) {
            if let Err(e) = self.core.db.delete_picture(id) {
                tracing::error!(picture_id = %id, error = %e, "Could not undo SQL insert");
            }
            self.discard_file(id, &destination);
            return Err(match source {
                IndexError::Corrupt(_) => AddError::CorruptIndexError {
                    id: id.to_string(),
                    source,
                },
                source => AddError::IndexError {
                    id: id.to_string(),
                    source,
                },
            });
        }

        Ok(record)
    }

    fn discard_file(&self, id: &str, destination: &Path) {
        if let Err(e) = fs::remove_file(destination) {
            tracing::error!(picture_id = %id, error = %e, "Could not remove copied picture");
        }
    }

    /// Ingest every file below `dir`. Individual failures are collected in
    /// the result; only a failing traversal aborts.
    pub fn add_directory(&self, dir: &Path) -> Result<AddResult, AddError> {
        if !dir.is_dir() {
            return Err(AddError::NotADirectory(dir.to_path_buf()));
        }

        let files = discover_files(dir, self.core.config.max_directory_depth).map_err(|e| {
            AddError::IoError {
                path: e.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf),
                source: e.into(),
            }
        })?;

        let mut result = AddResult::default();
        for file in files {
            match self.add_picture(&file) {
                Ok(id) => result.added.push(id),
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "Picture not added");
                    result.failed.push((file, e.kind()));
                }
            }
        }

        let _enter = self.core.span.enter();
        tracing::info!(
            dir = %dir.display(),
            added = result.ok(),
            failed = result.failed.len(),
            "Directory import finished"
        );
        Ok(result)
    }

    /// Queue a thumbnail for the picture. Does nothing if it already exists.
    pub fn create_thumbnail(&self, id: &str) -> Result<(), BankError> {
        if !self.core.contains(id) {
            return Err(BankError::UnknownPicture(id.to_string()));
        }
        self.core
            .processor
            .create_thumbnail(self.picture_path(id), self.thumbnail_path(id))?;
        Ok(())
    }

    /// Block until every queued thumbnail has been rendered.
    pub fn wait_for_thumbnails(&self) {
        self.core.processor.wait_idle();
    }

    // ========================================================================
    // Browsing
    // ========================================================================

    pub fn count(&self) -> usize {
        lock(&self.core.membership).ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.core.contains(id)
    }

    /// Snapshot of every id, oldest first.
    pub fn ids(&self) -> Vec<String> {
        lock(&self.core.membership).ids.clone()
    }

    fn browser(&self, ids: Vec<String>) -> Result<Browser, BankError> {
        let core: Arc<dyn PictureSource> = self.core.clone();
        let source: Weak<dyn PictureSource> = Arc::downgrade(&core);
        Ok(Browser::new(ids, source)?)
    }

    pub fn get_all(&self) -> Result<Browser, BankError> {
        self.browser(self.ids())
    }

    /// Browse the pictures matching `query`, at most `limit` of them.
    pub fn filter(&self, query: &PictureQuery, limit: usize) -> Result<Browser, BankError> {
        let ids = self.core.indexer.search(query, limit)?;
        self.browser(ids)
    }

    /// Browse `n` distinct pictures picked at random, in bank order.
    pub fn random(&self, n: usize) -> Result<Browser, BankError> {
        let ids = self.ids();
        let picked = random::select(&ids, n, &mut rand::thread_rng());
        self.browser(picked)
    }

    /// Shared handle to a picture, loaded on first use.
    pub fn picture(&self, id: &str) -> Result<Picture, BankError> {
        self.core.picture(id)
    }

    // ========================================================================
    // Picture edits by id
    // ========================================================================

    fn known_tag(&self, tag_id: TagId) -> Result<Tag, BankError> {
        self.core
            .tags
            .get_tag(tag_id)
            .ok_or(BankError::Picture(PictureError::UnknownTag(tag_id)))
    }

    /// Undo assignments of tags removed while they were being attached.
    /// `remove_tag` sweeps the cache only once, so a late assignment would
    /// otherwise linger in memory.
    fn drop_removed_tags(&self, picture: &Picture, tag_ids: &[TagId]) -> Result<(), BankError> {
        let mut removed = None;
        for &tag_id in tag_ids {
            if !self.core.tags.has_tag(tag_id) {
                picture.forget_tag(tag_id);
                removed = Some(tag_id);
            }
        }
        match removed {
            Some(tag_id) => Err(BankError::Picture(PictureError::UnknownTag(tag_id))),
            None => Ok(()),
        }
    }

    pub fn tag_picture(&self, id: &str, tag_id: TagId) -> Result<(), BankError> {
        let tag = self.known_tag(tag_id)?;
        let picture = self.picture(id)?;
        picture.add_tag(&tag)?;
        self.drop_removed_tags(&picture, &[tag_id])
    }

    pub fn untag_picture(&self, id: &str, tag_id: TagId) -> Result<(), BankError> {
        self.picture(id)?.remove_tag(tag_id)?;
        Ok(())
    }

    pub fn set_picture_tags(&self, id: &str, tag_ids: &[TagId]) -> Result<(), BankError> {
        let tags = tag_ids
            .iter()
            .map(|tag_id| self.known_tag(*tag_id))
            .collect::<Result<Vec<_>, _>>()?;
        let picture = self.picture(id)?;
        picture.set_tag_list(&tags)?;
        self.drop_removed_tags(&picture, tag_ids)
    }

    pub fn set_picture_grade(&self, id: &str, grade: u8) -> Result<(), BankError> {
        self.picture(id)?.set_grade(grade)?;
        Ok(())
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub fn tags(&self) -> &TagRepository {
        &self.core.tags
    }

    pub fn tag_set(&self) -> Vec<Tag> {
        self.core.tags.tag_set()
    }

    pub fn add_tag(
        &self,
        parent: TagId,
        name: &str,
        description: &str,
        selectable: bool,
    ) -> Result<Tag, BankError> {
        let _enter = self.core.span.enter();
        Ok(self.core.tags.add_tag(parent, name, description, selectable)?)
    }

    pub fn edit_tag(
        &self,
        id: TagId,
        parent: TagId,
        name: &str,
        description: &str,
        selectable: bool,
    ) -> Result<Tag, BankError> {
        let _enter = self.core.span.enter();
        Ok(self.core.tags.edit_tag(id, parent, name, description, selectable)?)
    }

    /// Remove a tag, detach it from every picture and refresh their index
    /// documents.
    pub fn remove_tag(&self, tag_id: TagId) -> Result<Tag, BankError> {
        let _enter = self.core.span.enter();
        let carriers = self.core.db.select_picture_ids_by_tag(tag_id)?;
        let removed = self.core.tags.remove_tag(tag_id)?;

        let mut affected: HashSet<String> = carriers.into_iter().collect();
        for picture in self.core.cache.cached() {
            if picture.forget_tag(tag_id) {
                affected.insert(picture.id().to_string());
            }
        }

        for id in &affected {
            if let Err(e) = self.reindex_picture(id) {
                tracing::error!(picture_id = %id, tag_id, error = %e, "Re-index after tag removal failed");
            }
        }
        Ok(removed)
    }

    /// Number of stored pictures carrying the tag. Pending edits are not
    /// counted until written back.
    pub fn count_pictures_with_tag(&self, tag_id: TagId) -> Result<u64, BankError> {
        Ok(self.core.db.count_pictures_with_tag(tag_id)?)
    }

    pub fn pictures_with_tag(&self, tag_id: TagId) -> Result<Vec<String>, BankError> {
        Ok(self.core.db.select_picture_ids_by_tag(tag_id)?)
    }

    // ========================================================================
    // Write-back and maintenance
    // ========================================================================

    /// Write every dirty cached picture back now. Returns how many were
    /// written.
    pub fn flush(&self) -> usize {
        let _enter = self.core.span.enter();
        self.core.updates.drain();
        self.core
            .cache
            .cached()
            .iter()
            .filter(|picture| self.core.persister.write_back(picture, None) == WriteBack::Written)
            .count()
    }

    pub fn update_stats(&self) -> UpdateStats {
        self.core.persister.stats()
    }

    /// Pictures waiting for a deferred write-back.
    pub fn pending_updates(&self) -> usize {
        self.core.updates.len()
    }

    pub fn cached_pictures(&self) -> usize {
        self.core.cache.len()
    }

    pub fn reindex_picture(&self, id: &str) -> Result<(), BankError> {
        let record = self
            .core
            .current_record(id)?
            .ok_or_else(|| BankError::UnknownPicture(id.to_string()))?;
        self.core.indexer.index_picture(&record)?;
        Ok(())
    }

    /// Rebuild the whole index from the current state of every picture.
    pub fn reindex_all(&self) -> Result<usize, BankError> {
        let _enter = self.core.span.enter();
        let mut records = Vec::new();
        for id in self.ids() {
            match self.core.current_record(&id)? {
                Some(record) => records.push(record),
                None => tracing::warn!(picture_id = %id, "Picture has no stored row"),
            }
        }
        let count = self.core.indexer.reindex_all(&records)?;
        tracing::info!(pictures = count, "Index rebuilt");
        Ok(count)
    }

    /// Stop the worker, write back dirty pictures, drain thumbnail jobs and
    /// release the index and the database. Safe to call more than once.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _enter = self.core.span.enter();

        self.core.updates.stop();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("Update worker panicked");
            }
        }

        let flushed = self.core.cache.invalidate_all();
        self.core.processor.shutdown();

        if let Err(e) = self.core.indexer.close() {
            tracing::error!(error = %e, "Failed to close index");
        }
        if let Err(e) = self.core.db.close() {
            tracing::error!(error = %e, "Failed to close database");
        }

        let stats = self.update_stats();
        tracing::info!(
            cached = flushed,
            written = stats.written,
            failed = stats.failed,
            "Closed picture bank"
        );
    }
}

impl Drop for PictureBank {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy `src` to a `dest` that must not exist yet.
fn copy_new(src: &Path, dest: &Path) -> io::Result<()> {
    let mut reader = File::open(src)?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(dest)?;
    let copied = io::copy(&mut reader, &mut writer).and_then(|_| writer.sync_all());
    if let Err(e) = copied {
        drop(writer);
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    Ok(())
}
