use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::registry::{LeakEntry, LeakSnapshot};
use crate::stack::FramePtr;
use crate::tree::Tree;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");
const URL: &str = env!("CARGO_PKG_REPOSITORY");

static REPORT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Build the leak report and write it to a tempfile, returning its path.
///
/// The file is a single HTML page wrapping the plain-text dump in an `<xmp>`
/// block, so it opens in any browser and folds in any text editor.
pub(crate) fn write<F>(
  snapshot: &LeakSnapshot,
  config: &TrackerConfig,
  resolve: F,
) -> Result<PathBuf, TrackerError>
where
  F: Fn(&[FramePtr]) -> Vec<String>,
{
  let body = render(snapshot, config, resolve);
  let path = report_path();

  fs::write(&path, format!("<html><body><xmp>{body}</xmp></body></html>"))?;
  log::info!("leak report written to {}", path.display());

  Ok(path)
}

/// Render the plain-text report body.
pub(crate) fn render<F>(
  snapshot: &LeakSnapshot,
  config: &TrackerConfig,
  resolve: F,
) -> String
where
  F: Fn(&[FramePtr]) -> Vec<String>,
{
  let mut out = String::new();

  // Writing into a String cannot fail.
  let _ = render_into(&mut out, snapshot, config, resolve);

  out
}

fn render_into<F>(
  out: &mut String,
  snapshot: &LeakSnapshot,
  config: &TrackerConfig,
  resolve: F,
) -> fmt::Result
where
  F: Fn(&[FramePtr]) -> Vec<String>,
{
  // Records registered before the current epoch are invisible to reports.
  let survivors: Vec<&LeakEntry> = snapshot
    .entries
    .iter()
    .filter(|entry| entry.id >= snapshot.epoch)
    .collect();

  let wasted: u64 = survivors.iter().map(|entry| entry.size as u64).sum();
  let n_leak = survivors.len();
  let score = leak_score(n_leak, snapshot.total_watched);

  log::info!("found {n_leak} leaks wasting {wasted} bytes");

  let (mut origins, mut sites, unique) = build_trees(&survivors, config);
  origins.recalc();
  sites.recalc();

  let frames: Vec<FramePtr> = unique.iter().copied().collect();
  log::info!("resolving {} unique frames", frames.len());
  let names = resolve(&frames);
  let names_len = names.len();

  let resolved = names_len == frames.len();
  let translate: HashMap<FramePtr, String> = if resolved {
    frames.iter().copied().zip(names).collect()
  } else {
    // Partial symbolization is worse than none; fall back to raw addresses
    // for every frame rather than misattribute names.
    frames
      .iter()
      .map(|&frame| (frame, format!("{frame:#x}")))
      .collect()
  };

  writeln!(out, "{NAME} says: generated with {NAME}-{VERSION} ({URL})")?;
  writeln!(
    out,
    "{NAME} says: best viewed in a foldable text editor with tabs=2sp \
     and no word-wrap"
  )?;
  writeln!(
    out,
    "{NAME} says: {}, {n_leak} leaks found; {wasted} bytes wasted \
     ('{score}' score)",
    if n_leak == 0 { "ok" } else { "error" },
  )?;

  if !resolved {
    writeln!(
      out,
      "{NAME} says: cannot resolve all frames ({} vs {names_len}); \
       raw addresses shown",
      frames.len(),
    )?;
  }

  if n_leak > 0 && frames.is_empty() {
    writeln!(
      out,
      "{NAME} says: no callstacks available; is debug information present?"
    )?;
  }

  let label = |frame: &FramePtr| {
    translate
      .get(frame)
      .cloned()
      .unwrap_or_else(|| format!("{frame:#x}"))
  };

  writeln!(out)?;
  writeln!(out, "root-to-leaf tree: where leaks originate")?;
  origins.rekey(label).print(out)?;
  writeln!(out)?;
  writeln!(out, "leaf-to-root tree: where leaks are finally allocated")?;
  sites.rekey(label).print(out)?;

  Ok(())
}

/// Builds the two call-site trees, each leak path weighted by its size, plus
/// the set of unique frames across all surviving callstacks.
fn build_trees(
  survivors: &[&LeakEntry],
  config: &TrackerConfig,
) -> (Tree<FramePtr, u64>, Tree<FramePtr, u64>, BTreeSet<FramePtr>) {
  let mut origins = Tree::new();
  let mut sites = Tree::new();
  let mut unique = BTreeSet::new();

  for entry in survivors {
    let frames = entry.callstack.trimmed(config.skip_begin, config.skip_end);

    if frames.is_empty() {
      continue;
    }

    unique.extend(frames.iter().copied());

    // Captured frames are most-recent first; the root-to-leaf tree walks
    // them oldest first, the leaf-to-root tree in capture order.
    origins
      .insert_path(frames.iter().rev().copied())
      .add_value(entry.size as u64);
    sites
      .insert_path(frames.iter().copied())
      .add_value(entry.size as u64);
  }

  (origins, sites, unique)
}

fn leak_score(n_leak: usize, total_watched: u64) -> &'static str {
  if n_leak == 0 || total_watched == 0 {
    return "perfect!";
  }

  let pct = n_leak as f64 * 100.0 / total_watched as f64;

  if pct <= 1.25 {
    "excellent"
  } else if pct <= 2.5 {
    "good"
  } else if pct <= 5.0 {
    "poor"
  } else if pct <= 10.0 {
    "mediocre"
  } else {
    "lame"
  }
}

fn report_path() -> PathBuf {
  let seq = REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
  let pid = std::process::id();

  std::env::temp_dir().join(format!("{NAME}-{pid}-{seq}.html"))
}

/// Hand a generated report off to the OS's default viewer.
///
/// # Errors
///
/// Returns an error if the viewer process cannot be spawned.
pub fn view(path: &Path) -> Result<(), TrackerError> {
  let mut command = viewer_command();
  command.arg(path);
  command.spawn()?;

  Ok(())
}

#[cfg(target_os = "windows")]
fn viewer_command() -> Command {
  let mut command = Command::new("cmd");
  command.args(["/C", "start", ""]);
  command
}

#[cfg(target_os = "macos")]
fn viewer_command() -> Command {
  Command::new("open")
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn viewer_command() -> Command {
  Command::new("xdg-open")
}
