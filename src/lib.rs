//! Callstack-based memory leak detector.
//!
//! `leakscope` links into a host program, intercepts dynamic allocations and
//! deallocations, and reports memory that was allocated but never released.
//! Every live allocation is annotated with the callstack captured at the
//! moment of allocation; on demand (or when the exit guard drops) the set of
//! still-live allocations is aggregated into two weighted call trees and
//! written out as a single report file.
//!
//! ## Example
//!
//! ```rust
//! let tracker = leakscope::Tracker::new();
//!
//! tracker.watch(0x1000, 64);
//! tracker.watch(0x2000, 128);
//! tracker.forget(0x1000);
//!
//! let stats = tracker.summary();
//! assert_eq!(stats.leaks, 1);
//! assert_eq!(stats.usage, 128);
//! assert_eq!(stats.peak, 192);
//! ```
//!
//! Hosts that want every heap allocation tracked install
//! [`TrackingAllocator`] as the global allocator and use the module-level
//! functions, which share one process-global [`Tracker`].

mod alloc;
mod config;
mod error;
mod registry;
mod report;
mod server;
mod stack;
mod symbolize;
mod tree;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use {
  alloc::TrackingAllocator,
  config::TrackerConfig,
  error::{badalloc, fail, TrackerError},
  registry::{ExitReport, Stats, Tracker, TrackerBuilder},
  stack::{Callstack, FramePtr, MAX_FRAMES},
  symbolize::{resolve_batch, UNRESOLVED},
  tree::Tree,
};

static TRACKER: OnceLock<Tracker> = OnceLock::new();
static INSTALL_CONFIG: OnceLock<TrackerConfig> = OnceLock::new();

/// Installs `config` for the process-global tracker and returns the tracker.
///
/// Only effective before the global tracker's first use; afterwards the
/// configuration already in effect is kept.
pub fn install(config: TrackerConfig) -> &'static Tracker {
  let _ = INSTALL_CONFIG.set(config);
  global()
}

/// The process-global tracker, created lazily on first access.
///
/// Construction allocates nothing, so the first access may safely come from
/// inside an allocation hook.
pub fn global() -> &'static Tracker {
  let tracker = TRACKER.get_or_init(|| {
    Tracker::with_config(INSTALL_CONFIG.get().copied().unwrap_or_default())
  });

  tracker.ensure_status_endpoint();

  tracker
}

/// Register a live allocation with the global tracker.
pub fn watch(addr: usize, size: usize) {
  global().watch(addr, size);
}

/// De-register an allocation from the global tracker.
pub fn forget(addr: usize) {
  global().forget(addr);
}

/// Look up the recorded size of a live allocation.
#[must_use]
pub fn query_size(addr: usize) -> Option<usize> {
  global().query_size(addr)
}

/// Begin a new epoch on the global tracker.
pub fn restart() {
  global().restart();
}

/// Snapshot of the global tracker's counters.
#[must_use]
pub fn summary() -> Stats {
  global().summary()
}

/// Generate a leak report from the global tracker.
///
/// # Errors
///
/// Returns an error if the report file cannot be written.
pub fn report() -> Result<PathBuf, TrackerError> {
  global().report()
}

/// Open a generated report in the OS's default viewer.
///
/// # Errors
///
/// Returns an error if the viewer process cannot be spawned.
pub fn view(path: &Path) -> Result<(), TrackerError> {
  report::view(path)
}

/// Returns the guard whose drop generates and opens the final report, when
/// `report_on_exit` is configured. Hold it in `main` for the life of the
/// program.
pub fn exit_guard() -> ExitReport {
  ExitReport::new(global())
}
