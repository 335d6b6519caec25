//! Record store backing the viewer.
//!
//! A [`RecordStore`] binds one record file at a time. Each successful
//! [`open`](RecordStore::open) creates a fresh session holding the file
//! handle, the sparse offset index, one count buffer per monitored class and
//! the lazily derived points of interest. A load still running against an
//! older session finishes there and never touches the new one.
//!
//! # Concurrency
//!
//! - One loader per session, claimed first-caller-wins by [`RecordStore::load`]
//! - Any number of readers; the only contended lock is the file cursor, held
//!   for one seek + read pair
//! - Count element `k` is appended before the record count is published as
//!   `k + 1`, so `num_records()` never runs ahead of a buffer

use crate::StoreOptions;
use crate::buffer::{Appender, GrowableBuffer};
use crate::error::RecordError;
use crate::record::{Example, HEADER_SIZE, decode_header};
use crate::strategy::{ScoringStrategy, StrategyFactory};
use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use prost::Message;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Progress of the load of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// `load()` has not been claimed yet
    NotStarted,
    /// A loader is streaming the file
    Loading,
    /// Streaming stopped; the ingested prefix is final
    Loaded,
}

/// Lifecycle of the store as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// No file has been opened
    Closed,
    /// The last `open()` failed; queries return empty results
    OpenFailed,
    /// A file is bound and its load is in the given state
    Open(LoadState),
}

/// Why a load stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStop {
    /// The file ended exactly on a record boundary
    EndOfStream,
    /// A record could not be ingested; everything before it is kept
    Error(RecordError),
}

/// Outcome of one completed load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Records ingested
    pub records: u32,
    /// Bytes consumed by the ingested records
    pub bytes: u64,
    /// Termination cause
    pub stop: LoadStop,
}

/// State bound to one opened file
struct Session {
    path: PathBuf,
    dir: PathBuf,
    file_len: u64,
    /// File cursor; held for one seek + read pair
    file: Mutex<File>,
    offsets: RwLock<BTreeMap<u32, u64>>,
    counts: Vec<GrowableBuffer<i8>>,
    /// Taken by the loader that wins the claim
    appenders: Mutex<Option<Vec<Appender<i8>>>>,
    num_records: AtomicU32,
    state: Mutex<LoadState>,
    loaded: Condvar,
    report: OnceLock<LoadReport>,
    strategy: Mutex<Box<dyn ScoringStrategy>>,
    pois: OnceLock<Vec<Vec<u32>>>,
}

impl Session {
    fn open(path: &Path, options: &StoreOptions, strategy: Box<dyn ScoringStrategy>) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open record file: {}", path.display()))?;
        FileExt::try_lock_shared(&file)
            .with_context(|| format!("Record file is being written: {}", path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("Failed to stat record file: {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("Record file is not a regular file: {}", path.display());
        }
        let file_len = metadata.len();

        let (appenders, counts) = options
            .monitored_classes
            .iter()
            .map(|_| GrowableBuffer::new(options.buffer_chunk))
            .unzip();

        Ok(Self {
            path: path.to_path_buf(),
            dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            file_len,
            file: Mutex::new(file),
            offsets: RwLock::new(BTreeMap::from([(0, 0)])),
            counts,
            appenders: Mutex::new(Some(appenders)),
            num_records: AtomicU32::new(0),
            state: Mutex::new(LoadState::NotStarted),
            loaded: Condvar::new(),
            report: OnceLock::new(),
            strategy: Mutex::new(strategy),
            pois: OnceLock::new(),
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn read_header(&self, offset: u64) -> Result<u64, RecordError> {
        let mut header = [0u8; HEADER_SIZE];
        self.read_at(&mut header, offset)
            .map_err(|e| RecordError::HeaderRead { offset, kind: e.kind() })?;
        decode_header(&header, offset)
    }

    fn load_state(&self) -> LoadState {
        *self.state.lock()
    }

    /// Moves `NotStarted` to `Loading`; false if someone else already did
    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LoadState::NotStarted {
            return false;
        }
        *state = LoadState::Loading;
        true
    }

    fn load(&self, options: &StoreOptions) -> Option<LoadReport> {
        if !self.claim() {
            tracing::debug!(path = %self.path.display(), "load already claimed");
            return None;
        }
        let mut appenders = self.appenders.lock().take().unwrap_or_default();
        let mut strategy = self.strategy.lock();

        let report = self.ingest(options, &mut appenders, strategy.as_mut());
        drop(strategy);

        match &report.stop {
            LoadStop::EndOfStream => tracing::info!(
                path = %self.path.display(),
                records = report.records,
                bytes = report.bytes,
                "load complete"
            ),
            LoadStop::Error(err) => tracing::warn!(
                path = %self.path.display(),
                records = report.records,
                error = %err,
                "load stopped early"
            ),
        }

        let report = self.report.get_or_init(|| report).clone();
        *self.state.lock() = LoadState::Loaded;
        self.loaded.notify_all();
        Some(report)
    }

    fn ingest(
        &self,
        options: &StoreOptions,
        appenders: &mut [Appender<i8>],
        strategy: &mut dyn ScoringStrategy,
    ) -> LoadReport {
        let mut offset = 0u64;
        let mut ordinal = 0u32;
        let mut payload = vec![0u8; options.max_record_size];
        let mut counts = vec![0u32; options.monitored_classes.len()];

        let stop = loop {
            if offset >= self.file_len {
                break LoadStop::EndOfStream;
            }
            let next = match next_ordinal(ordinal) {
                Ok(next) => next,
                Err(err) => break LoadStop::Error(err),
            };
            match self.ingest_one(options, offset, ordinal, &mut payload, &mut counts, strategy) {
                Ok(size) => {
                    if let Err(err) = push_counts(appenders, &counts) {
                        break LoadStop::Error(err);
                    }
                    offset += HEADER_SIZE as u64 + size;
                    ordinal = next;
                    self.num_records.store(ordinal, Ordering::Release);

                    if ordinal % options.index_stride == 0 {
                        self.offsets.write().insert(ordinal, offset);
                        tracing::debug!(ordinal, offset, "index entry");
                    }
                }
                Err(err) => break LoadStop::Error(err),
            }
        };

        LoadReport { records: ordinal, bytes: offset, stop }
    }

    /// Reads, decodes and scores one record; returns its payload size
    fn ingest_one(
        &self,
        options: &StoreOptions,
        offset: u64,
        ordinal: u32,
        payload: &mut [u8],
        counts: &mut [u32],
        strategy: &mut dyn ScoringStrategy,
    ) -> Result<u64, RecordError> {
        let size = self.read_header(offset)?;
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= payload.len())
            .ok_or(RecordError::PayloadTooLarge { ordinal, size, max: payload.len() })?;

        let payload = &mut payload[..len];
        self.read_at(payload, offset + HEADER_SIZE as u64)
            .map_err(|e| RecordError::PayloadRead { ordinal, kind: e.kind() })?;
        let example = Example::decode(&payload[..])
            .map_err(|source| RecordError::PayloadParse { ordinal, source })?;

        strategy.count(
            &example.classes,
            &example.scores,
            example.num_detections,
            &options.monitored_classes,
            options.score_threshold,
            counts,
        )?;
        Ok(size)
    }

    fn item_path(&self, index: u32, max_record_size: usize) -> Result<PathBuf> {
        let available = self.num_records.load(Ordering::Acquire);
        if index >= available {
            return Err(RecordError::OutOfRange { index, available }.into());
        }

        let (base, mut offset) = self
            .offsets
            .read()
            .range(..=index)
            .next_back()
            .map(|(&ordinal, &offset)| (ordinal, offset))
            .unwrap_or((0, 0));

        for _ in base..index {
            offset += HEADER_SIZE as u64 + self.read_header(offset)?;
        }

        let size = self.read_header(offset)?;
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= max_record_size)
            .ok_or(RecordError::PayloadTooLarge { ordinal: index, size, max: max_record_size })?;
        let mut payload = vec![0u8; len];
        self.read_at(&mut payload, offset + HEADER_SIZE as u64)
            .map_err(|e| RecordError::PayloadRead { ordinal: index, kind: e.kind() })?;
        let example = Example::decode(payload.as_slice())
            .map_err(|source| RecordError::PayloadParse { ordinal: index, source })?;

        Ok(self.dir.join(example.filename))
    }

    /// Points of interest per class, computed on first use after the load
    fn pois(&self) -> Option<&[Vec<u32>]> {
        if self.load_state() != LoadState::Loaded {
            return None;
        }
        let pois = self.pois.get_or_init(|| {
            let mut strategy = self.strategy.lock();
            self.counts
                .iter()
                .enumerate()
                .map(|(class_idx, counts)| {
                    strategy.change_points(&counts.snapshot()).unwrap_or_else(|err| {
                        tracing::warn!(class_idx, error = %err, "change point detection failed");
                        Vec::new()
                    })
                })
                .collect()
        });
        Some(pois.as_slice())
    }

    fn wait_until_loaded(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != LoadState::Loaded {
            if self.loaded.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state == LoadState::Loaded
    }
}

fn saturate(count: u32) -> i8 {
    i8::try_from(count).unwrap_or(i8::MAX)
}

/// Ordinal following `ordinal`, or an error once the record space is exhausted
fn next_ordinal(ordinal: u32) -> Result<u32, RecordError> {
    ordinal.checked_add(1).ok_or(RecordError::TooManyRecords { limit: u32::MAX })
}

/// Appends one count to every class buffer, or to none of them
///
/// Capacity for the new element is secured on all buffers first, so a failed
/// growth leaves every buffer at the same length.
fn push_counts(appenders: &mut [Appender<i8>], counts: &[u32]) -> Result<(), RecordError> {
    for appender in appenders.iter_mut() {
        appender.reserve(appender.len() + 1)?;
    }
    for (appender, &count) in appenders.iter_mut().zip(counts) {
        appender.push(saturate(count))?;
    }
    Ok(())
}

enum Slot {
    Closed,
    OpenFailed,
    Open(Arc<Session>),
}

/// Record store and analytics engine
///
/// Owns the bound file and everything derived from it. Share it between the
/// UI and a background loader with `Arc<RecordStore>`; every method takes
/// `&self`.
///
/// # Example
///
/// ```no_run
/// use detview_core::{RecordStore, StoreOptions};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> anyhow::Result<()> {
/// let store = Arc::new(RecordStore::new(StoreOptions::default())?);
/// store.open("results/detections.bin")?;
///
/// let loader = store.load_in_background()?;
/// store.wait_until_loaded(Duration::from_secs(30));
///
/// let first_change = store.next_poi(0);
/// println!("{}", store.item_path(first_change)?.display());
/// # let _ = loader.join();
/// # Ok(())
/// # }
/// ```
pub struct RecordStore {
    options: StoreOptions,
    factory: StrategyFactory,
    slot: RwLock<Slot>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Creates a closed store using the strategy named in `options`
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(options: StoreOptions) -> Result<Self> {
        let factory = options.strategy.factory();
        Self::with_strategy(options, factory)
    }

    /// Creates a closed store with a caller-provided strategy factory
    ///
    /// The factory is invoked once per `open()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_strategy(options: StoreOptions, factory: StrategyFactory) -> Result<Self> {
        options.validate()?;
        Ok(Self { options, factory, slot: RwLock::new(Slot::Closed) })
    }

    /// Binds a record file, discarding everything derived from a previous one
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for reading or is
    /// exclusively locked by a writer. The store is then in
    /// [`StoreState::OpenFailed`] until the next successful `open`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        match Session::open(path, &self.options, (self.factory)()) {
            Ok(session) => {
                tracing::info!(path = %path.display(), bytes = session.file_len, "record file opened");
                *self.slot.write() = Slot::Open(Arc::new(session));
                Ok(())
            }
            Err(err) => {
                *self.slot.write() = Slot::OpenFailed;
                Err(err)
            }
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        match &*self.slot.read() {
            Slot::Open(session) => Some(Arc::clone(session)),
            Slot::Closed | Slot::OpenFailed => None,
        }
    }

    /// Streams the whole file, unless another caller already claimed it
    ///
    /// Returns `None` without waiting when the load of this session is in
    /// progress or done, or when no file is open. Per-record failures end the
    /// load and are reported in [`LoadReport::stop`]; the ingested prefix
    /// stays queryable either way.
    pub fn load(&self) -> Option<LoadReport> {
        self.session()?.load(&self.options)
    }

    /// Runs [`load`](Self::load) on a dedicated worker thread
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn load_in_background(self: &Arc<Self>) -> Result<JoinHandle<Option<LoadReport>>> {
        let store = Arc::clone(self);
        thread::Builder::new()
            .name("detview-loader".into())
            .spawn(move || store.load())
            .context("Failed to spawn loader thread")
    }

    /// Blocks until the current session is loaded or `timeout` elapses
    ///
    /// Returns true if the load completed. Does not start a load.
    pub fn wait_until_loaded(&self, timeout: Duration) -> bool {
        self.session().is_some_and(|session| session.wait_until_loaded(timeout))
    }

    /// Lifecycle state
    pub fn state(&self) -> StoreState {
        match &*self.slot.read() {
            Slot::Closed => StoreState::Closed,
            Slot::OpenFailed => StoreState::OpenFailed,
            Slot::Open(session) => StoreState::Open(session.load_state()),
        }
    }

    /// Load state of the current session (`NotStarted` when nothing is open)
    pub fn load_state(&self) -> LoadState {
        self.session().map_or(LoadState::NotStarted, |session| session.load_state())
    }

    /// Report of the finished load, if any
    pub fn load_report(&self) -> Option<LoadReport> {
        self.session()?.report.get().cloned()
    }

    /// Records ingested so far
    pub fn num_records(&self) -> u32 {
        self.session().map_or(0, |session| session.num_records.load(Ordering::Acquire))
    }

    /// Path of the bound record file
    pub fn path(&self) -> Option<PathBuf> {
        self.session().map(|session| session.path.clone())
    }

    /// Configuration the store was built with
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Snapshot of the sparse offset index as `(ordinal, byte offset)` pairs
    pub fn index_entries(&self) -> Vec<(u32, u64)> {
        self.session().map_or_else(Vec::new, |session| {
            session.offsets.read().iter().map(|(&k, &v)| (k, v)).collect()
        })
    }

    /// Image path of record `index`
    ///
    /// Seeks to the nearest indexed ordinal at or below `index` and walks
    /// forward header by header. Safe to call while a load is running.
    ///
    /// # Errors
    ///
    /// - [`RecordError::NotOpen`] if no file is bound
    /// - [`RecordError::OutOfRange`] if `index` has not been ingested yet
    /// - Read or parse errors of the records walked over
    pub fn item_path(&self, index: u32) -> Result<PathBuf> {
        let session = self.session().ok_or(RecordError::NotOpen)?;
        session.item_path(index, self.options.max_record_size)
    }

    /// Snapshot of the detection counts of monitored class `class_idx`
    ///
    /// Empty if `class_idx` is not a monitored class index or nothing is open.
    pub fn num_detections(&self, class_idx: usize) -> Vec<i8> {
        self.session()
            .and_then(|session| session.counts.get(class_idx).map(GrowableBuffer::snapshot))
            .unwrap_or_default()
    }

    /// Derives the points of interest of every class, once per session
    ///
    /// Returns false (and does nothing) until the load has finished.
    /// Concurrent callers wait for the first computation and reuse it.
    pub fn identify_points_of_interest(&self) -> bool {
        self.session().is_some_and(|session| session.pois().is_some())
    }

    /// Points of interest of monitored class `class_idx`
    pub fn points_of_interest(&self, class_idx: usize) -> Vec<u32> {
        self.session()
            .and_then(|session| session.pois().and_then(|pois| pois.get(class_idx).cloned()))
            .unwrap_or_default()
    }

    /// Smallest point of interest strictly after `index`, across all classes
    ///
    /// Returns `num_records()` when there is none or the load is unfinished.
    pub fn next_poi(&self, index: u32) -> u32 {
        let Some(session) = self.session() else {
            return 0;
        };
        let sentinel = session.num_records.load(Ordering::Acquire);
        let Some(pois) = session.pois() else {
            return sentinel;
        };
        pois.iter()
            .filter_map(|class| {
                let at = class.partition_point(|&poi| poi <= index);
                class.get(at).copied()
            })
            .min()
            .unwrap_or(sentinel)
    }

    /// Largest point of interest strictly before `index`, across all classes
    ///
    /// Returns 0 when there is none or the load is unfinished.
    pub fn prev_poi(&self, index: u32) -> u32 {
        let Some(session) = self.session() else {
            return 0;
        };
        let Some(pois) = session.pois() else {
            return 0;
        };
        pois.iter()
            .filter_map(|class| {
                let at = class.partition_point(|&poi| poi < index);
                at.checked_sub(1).and_then(|i| class.get(i).copied())
            })
            .max()
            .unwrap_or(0)
    }
}
