use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use nohash_hasher::BuildNoHashHasher;
use serde::Serialize;

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::stack::Callstack;
use crate::{report, server, symbolize};

thread_local! {
  static IN_CORE: Cell<bool> = const { Cell::new(false) };
}

// Frames the tracker itself adds on the capture path: the unwinder callback,
// `Callstack::capture`, and the public entry point.
const CAPTURE_SKIP: usize = 3;

/// Process-wide accounting counters.
///
/// `usage` is the sum of the sizes of all live records, `leaks` their count,
/// and `peak` the maximum `usage` observed during the current epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
  pub leaks: usize,
  pub usage: usize,
  pub peak: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
  pub size: usize,
  pub id: u64,
  pub callstack: Callstack,
}

/// One live allocation as seen by the reporter.
#[derive(Debug, Clone)]
pub(crate) struct LeakEntry {
  pub size: usize,
  pub id: u64,
  pub callstack: Callstack,
}

/// Consistent view of the registry taken under the lock.
#[derive(Debug, Clone)]
pub(crate) struct LeakSnapshot {
  pub entries: Vec<LeakEntry>,
  pub total_watched: u64,
  pub epoch: u64,
}

type AddressMap =
  HashMap<usize, AllocationRecord, BuildNoHashHasher<usize>>;

#[derive(Debug)]
struct RegistryInner {
  live: AddressMap,
  stats: Stats,
  total_watched: u64,
  next_id: u64,
  epoch: u64,
}

impl RegistryInner {
  fn new() -> Self {
    Self {
      live: AddressMap::default(),
      stats: Stats::default(),
      total_watched: 0,
      next_id: 1,
      epoch: 0,
    }
  }

  fn watch(&mut self, addr: usize, size: usize, callstack: Callstack) {
    let id = self.next_id;
    self.next_id += 1;
    self.total_watched += 1;

    let record = AllocationRecord {
      size,
      id,
      callstack,
    };

    match self.live.insert(addr, record) {
      // Replacing a live record keeps the leak count; only the byte delta
      // moves. Double allocation of one address is an allocator-level
      // artifact, not a host bug, so the old record is dropped silently.
      Some(old) => {
        self.stats.usage = self.stats.usage - old.size + size;
      }
      None => {
        self.stats.leaks += 1;
        self.stats.usage += size;
      }
    }

    if self.stats.usage > self.stats.peak {
      self.stats.peak = self.stats.usage;
    }
  }

  fn forget(&mut self, addr: usize) -> bool {
    match self.live.remove(&addr) {
      Some(record) => {
        self.stats.leaks -= 1;
        self.stats.usage -= record.size;
        true
      }
      None => false,
    }
  }

  fn restart(&mut self) {
    self.live.clear();
    self.stats = Stats::default();
    self.total_watched = 0;
    self.epoch = self.next_id;
  }

  fn snapshot(&self) -> LeakSnapshot {
    let entries = self
      .live
      .values()
      .map(|record| LeakEntry {
        size: record.size,
        id: record.id,
        callstack: record.callstack.clone(),
      })
      .collect();

    LeakSnapshot {
      entries,
      total_watched: self.total_watched,
      epoch: self.epoch,
    }
  }
}

/// Thin builder that customizes `TrackerConfig` without exposing all knobs
/// up front.
#[derive(Debug, Default)]
pub struct TrackerBuilder {
  config: TrackerConfig,
}

impl TrackerBuilder {
  #[must_use]
  pub fn new() -> Self {
    Self {
      config: TrackerConfig::default(),
    }
  }

  #[must_use]
  pub fn with_config(mut self, config: TrackerConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn max_frames(mut self, max_frames: usize) -> Self {
    self.config = self.config.with_max_frames(max_frames);
    self
  }

  #[must_use]
  pub fn report_wild_pointers(mut self, report: bool) -> Self {
    self.config.report_wild_pointers = report;
    self
  }

  #[must_use]
  pub fn report_on_exit(mut self, report: bool) -> Self {
    self.config.report_on_exit = report;
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  #[must_use]
  pub fn finish(self) -> Tracker {
    Tracker::with_config(self.config)
  }
}

/// The single point of truth for what is currently allocated.
///
/// One lock guards the registry and its counters. Entry from a thread that is
/// already inside the core is treated as a signal to skip the tracking event:
/// the outermost call is recorded, and allocations the core makes to service
/// it stay invisible. The coarse granularity is deliberate; the hook path has
/// to be deadlock-free against the host allocator's own lock before anything
/// else.
#[derive(Debug)]
pub struct Tracker {
  config: TrackerConfig,
  enabled: AtomicBool,
  endpoint_started: AtomicBool,
  inner: Mutex<RegistryInner>,
}

impl Default for Tracker {
  fn default() -> Self {
    Self::new()
  }
}

impl Tracker {
  #[must_use]
  pub fn new() -> Self {
    Self::with_config(TrackerConfig::default())
  }

  /// Constructs a tracker without touching the heap, so the lazily created
  /// global instance can be initialized from inside an allocation hook.
  #[must_use]
  pub fn with_config(config: TrackerConfig) -> Self {
    Self {
      config,
      enabled: AtomicBool::new(config.start_enabled),
      endpoint_started: AtomicBool::new(false),
      inner: Mutex::new(RegistryInner::new()),
    }
  }

  #[must_use]
  pub fn builder() -> TrackerBuilder {
    TrackerBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &TrackerConfig {
    &self.config
  }

  pub fn enable(&self) {
    self.enabled.store(true, Ordering::Release);
  }

  pub fn disable(&self) {
    self.enabled.store(false, Ordering::Release);
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.enabled.load(Ordering::Acquire)
  }

  /// Record that `size` bytes live at `addr`, annotated with the callstack
  /// captured here. Null addresses and reentrant calls are no-ops.
  pub fn watch(&self, addr: usize, size: usize) {
    if addr == 0 || !self.enabled() {
      return;
    }

    self.enter(|inner, config| {
      let callstack = Callstack::capture(CAPTURE_SKIP, config.max_frames);
      inner.watch(addr, size, callstack);
    });
  }

  /// Remove the record at `addr`. An unknown address leaves the registry
  /// untouched and, when wild-pointer reporting is on, logs a stack-traced
  /// warning.
  pub fn forget(&self, addr: usize) {
    if addr == 0 || !self.enabled() {
      return;
    }

    self.enter(|inner, config| {
      if !inner.forget(addr) && config.report_wild_pointers {
        warn_wild_pointer(addr, config);
      }
    });
  }

  /// Look up the recorded size of a live allocation.
  #[must_use]
  pub fn query_size(&self, addr: usize) -> Option<usize> {
    if addr == 0 {
      return None;
    }

    self
      .enter(|inner, _| inner.live.get(&addr).map(|record| record.size))
      .flatten()
  }

  /// Begin a new epoch: clear all entries and reset the counters. Records
  /// registered before the restart never appear in a later report.
  pub fn restart(&self) {
    self.enter(|inner, _| inner.restart());
  }

  /// Snapshot of the accounting counters.
  #[must_use]
  pub fn summary(&self) -> Stats {
    self.enter(|inner, _| inner.stats).unwrap_or_default()
  }

  /// Build the full leak report and return the path of the generated file.
  ///
  /// # Errors
  ///
  /// Returns an error if the report file cannot be written, or
  /// [`TrackerError::Reentrant`] when called from inside the core.
  pub fn report(&self) -> Result<PathBuf, TrackerError> {
    self
      .enter(|inner, config| {
        let snapshot = inner.snapshot();
        report::write(&snapshot, config, symbolize::resolve_batch)
      })
      .unwrap_or(Err(TrackerError::Reentrant))
  }

  /// Spawns the status endpoint once, if configured. Only the process-global
  /// tracker calls this; standalone instances stay silent.
  pub(crate) fn ensure_status_endpoint(&'static self) {
    if !self.config.webserver {
      return;
    }

    if self.endpoint_started.swap(true, Ordering::SeqCst) {
      return;
    }

    let was_inside = IN_CORE.get();
    IN_CORE.set(true);
    server::spawn(self);
    IN_CORE.set(was_inside);
  }

  fn enter<R>(
    &self,
    op: impl FnOnce(&mut RegistryInner, &TrackerConfig) -> R,
  ) -> Option<R> {
    if IN_CORE.get() {
      return None;
    }

    IN_CORE.set(true);

    let result = {
      let mut inner = self.lock_inner();
      op(&mut inner, &self.config)
    };

    IN_CORE.set(false);

    Some(result)
  }

  fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

fn warn_wild_pointer(addr: usize, config: &TrackerConfig) {
  let callstack = Callstack::capture(CAPTURE_SKIP, config.max_frames);
  let names = symbolize::resolve_batch(callstack.frames());

  let mut message = format!("wild pointer deallocation at {addr:#x}");
  for (index, name) in names.iter().enumerate() {
    message.push_str(&format!("\n\t{}) {name}", index + 1));
  }

  log::warn!("{message}");
}

/// RAII guard that generates and opens the final report when dropped.
///
/// Rust statics run no destructors, so a host that wants a report at exit
/// holds this guard in `main` for the life of the program.
#[must_use]
#[derive(Debug)]
pub struct ExitReport {
  tracker: &'static Tracker,
}

impl ExitReport {
  pub(crate) fn new(tracker: &'static Tracker) -> Self {
    Self { tracker }
  }

  fn finalize(&self) -> Option<PathBuf> {
    if !self.tracker.config().report_on_exit {
      return None;
    }

    self.tracker.report().ok()
  }
}

impl Drop for ExitReport {
  fn drop(&mut self) {
    if let Some(path) = self.finalize() {
      let _ = report::view(&path);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tracker() -> Tracker {
    Tracker::new()
  }

  struct CaptureLogger {
    warnings: Mutex<Vec<String>>,
  }

  impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
      metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
      if record.level() == log::Level::Warn {
        let mut warnings = self.warnings.lock().unwrap();
        warnings.push(record.args().to_string());
      }
    }

    fn flush(&self) {}
  }

  static CAPTURE: CaptureLogger = CaptureLogger {
    warnings: Mutex::new(Vec::new()),
  };

  #[test]
  fn matched_pairs_leave_nothing_behind() {
    let tracker = tracker();
    tracker.watch(0x1000, 64);
    tracker.watch(0x2000, 128);
    tracker.forget(0x1000);
    tracker.forget(0x2000);

    assert_eq!(
      tracker.summary(),
      Stats {
        leaks: 0,
        usage: 0,
        peak: 192,
      }
    );
  }

  #[test]
  fn unmatched_watches_accumulate() {
    let tracker = tracker();
    tracker.watch(0x1000, 64);
    tracker.watch(0x2000, 128);
    tracker.forget(0x1000);

    assert_eq!(
      tracker.summary(),
      Stats {
        leaks: 1,
        usage: 128,
        peak: 192,
      }
    );
  }

  #[test]
  fn second_watch_on_an_address_replaces_the_record() {
    let tracker = tracker();
    tracker.watch(0x1000, 100);
    tracker.watch(0x1000, 200);

    assert_eq!(
      tracker.summary(),
      Stats {
        leaks: 1,
        usage: 200,
        peak: 200,
      }
    );
    assert_eq!(tracker.query_size(0x1000), Some(200));
  }

  #[test]
  fn replacement_can_shrink_usage() {
    let tracker = tracker();
    tracker.watch(0x1000, 200);
    tracker.watch(0x1000, 50);

    assert_eq!(
      tracker.summary(),
      Stats {
        leaks: 1,
        usage: 50,
        peak: 200,
      }
    );
  }

  #[test]
  fn restart_clears_entries_and_counters() {
    let tracker = tracker();
    tracker.watch(0x1000, 10);
    tracker.restart();

    assert_eq!(tracker.summary(), Stats::default());
    assert_eq!(tracker.query_size(0x1000), None);
  }

  #[test]
  fn wild_forget_warns_once_and_leaves_counters_untouched() {
    log::set_logger(&CAPTURE).expect("no other logger in the test binary");
    log::set_max_level(log::LevelFilter::Warn);

    let tracker =
      Tracker::builder().report_wild_pointers(true).finish();
    tracker.watch(0x1000, 64);
    let before = tracker.summary();

    tracker.forget(0xBAD);

    let warnings = CAPTURE.warnings.lock().unwrap();
    let wild: Vec<&String> = warnings
      .iter()
      .filter(|message| {
        message.contains("wild pointer deallocation at 0xbad")
      })
      .collect();
    assert_eq!(wild.len(), 1);
    drop(warnings);

    assert_eq!(tracker.summary(), before);
  }

  #[test]
  fn zero_size_watch_is_tracked() {
    let tracker = tracker();
    tracker.watch(0x1000, 0);

    assert_eq!(tracker.summary().leaks, 1);
    assert_eq!(tracker.summary().usage, 0);
    assert_eq!(tracker.query_size(0x1000), Some(0));
  }

  #[test]
  fn null_address_is_a_noop() {
    let tracker = tracker();
    tracker.watch(0, 64);
    tracker.forget(0);

    assert_eq!(tracker.summary(), Stats::default());
    assert_eq!(tracker.query_size(0), None);
  }

  #[test]
  fn peak_tracks_the_maximum_prefix_sum() {
    let tracker = tracker();
    tracker.watch(0x1000, 100);
    tracker.watch(0x2000, 50);
    tracker.forget(0x1000);
    tracker.watch(0x3000, 30);

    assert_eq!(tracker.summary().usage, 80);
    assert_eq!(tracker.summary().peak, 150);
  }

  #[test]
  fn disabled_tracker_drops_events() {
    let tracker = Tracker::builder().start_enabled(false).finish();
    tracker.watch(0x1000, 16);

    assert_eq!(tracker.summary(), Stats::default());

    tracker.enable();
    tracker.watch(0x2000, 16);
    assert_eq!(tracker.summary().leaks, 1);
  }

  #[test]
  fn reentrant_calls_are_skipped() {
    let tracker = tracker();

    IN_CORE.set(true);
    tracker.watch(0x1000, 64);
    IN_CORE.set(false);

    assert_eq!(tracker.summary(), Stats::default());
  }

  #[test]
  fn watch_records_a_captured_callstack() {
    let tracker = tracker();
    tracker.watch(0x1000, 64);

    let snapshot = tracker
      .enter(|inner, _| inner.snapshot())
      .expect("snapshot");
    assert_eq!(snapshot.entries.len(), 1);
    assert!(!snapshot.entries[0].callstack.is_empty());
  }

  #[test]
  fn exit_report_is_a_noop_when_reporting_is_disabled() {
    let tracker: &'static Tracker =
      Box::leak(Box::new(Tracker::builder().report_on_exit(false).finish()));
    tracker.watch(0x1000, 64);

    let guard = ExitReport::new(tracker);
    assert_eq!(guard.finalize(), None);
    drop(guard);

    assert_eq!(tracker.summary().leaks, 1);
  }

  #[test]
  fn exit_report_writes_the_final_report_when_enabled() {
    let tracker: &'static Tracker =
      Box::leak(Box::new(Tracker::builder().finish()));
    tracker.watch(0x1000, 64);

    let guard = ExitReport::new(tracker);
    let path = guard.finalize().expect("final report");
    assert!(path.exists());

    let _ = std::fs::remove_file(path);
    // Dropping the guard would also hand the report to the OS viewer;
    // finalize has been observed directly, so skip that here.
    std::mem::forget(guard);
  }

  #[test]
  fn report_writes_a_file_that_excludes_pre_restart_records() {
    let tracker = tracker();
    tracker.watch(0x1000, 10);
    tracker.restart();
    tracker.watch(0x2000, 20);

    let path = tracker.report().expect("report file");
    let contents = std::fs::read_to_string(&path).expect("read report");
    assert!(contents.contains("1 leaks found; 20 bytes wasted"));

    let _ = std::fs::remove_file(path);
  }

  #[test]
  fn restart_advances_the_epoch_past_existing_ids() {
    let tracker = tracker();
    tracker.watch(0x1000, 10);
    tracker.restart();
    tracker.watch(0x2000, 20);

    let snapshot = tracker
      .enter(|inner, _| inner.snapshot())
      .expect("snapshot");
    assert_eq!(snapshot.entries.len(), 1);
    assert!(snapshot.entries[0].id >= snapshot.epoch);
  }
}
