use std::fmt::{self, Display, Formatter};

use crate::stack::MAX_FRAMES;

/// Controls how the tracker records allocations and presents reports.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
  /// Multiplicative inflation applied to every byte request forwarded to the
  /// system allocator; values below 1.0 are clamped. Used to stress-test a
  /// host under artificial memory pressure.
  pub allocs_overhead: f64,
  /// Maximum number of frames captured per callstack.
  pub max_frames: usize,
  /// Frames elided from the most-recent end of a callstack at report time.
  pub skip_begin: usize,
  /// Frames elided from the oldest end of a callstack at report time.
  pub skip_end: usize,
  /// Whether `forget` on an unknown address logs a stack-traced warning.
  pub report_wild_pointers: bool,
  /// Whether the allocator adapter zeroes freshly allocated regions.
  pub memset_allocations: bool,
  /// Whether dropping the exit guard generates and opens a final report.
  pub report_on_exit: bool,
  /// Whether the global tracker spawns the HTTP status endpoint.
  pub webserver: bool,
  /// TCP port for the status endpoint.
  pub webserver_port: u16,
  /// Whether the tracker records events immediately once constructed.
  pub start_enabled: bool,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      allocs_overhead: 1.0,
      max_frames: MAX_FRAMES,
      skip_begin: 0,
      skip_end: 0,
      report_wild_pointers: false,
      memset_allocations: true,
      report_on_exit: true,
      webserver: false,
      webserver_port: 2001,
      start_enabled: true,
    }
  }
}

impl TrackerConfig {
  /// Explicitly disable eager tracking start-up.
  #[must_use]
  pub fn disabled(mut self) -> Self {
    self.start_enabled = false;
    self
  }

  #[must_use]
  pub fn with_allocs_overhead(mut self, overhead: f64) -> Self {
    self.allocs_overhead = if overhead < 1.0 { 1.0 } else { overhead };
    self
  }

  /// Builder-style helper to adjust the captured callstack depth.
  #[must_use]
  pub fn with_max_frames(mut self, max_frames: usize) -> Self {
    self.max_frames = max_frames.clamp(1, MAX_FRAMES);
    self
  }

  #[must_use]
  pub fn with_skip(mut self, begin: usize, end: usize) -> Self {
    self.skip_begin = begin;
    self.skip_end = end;
    self
  }

  #[must_use]
  pub fn with_wild_pointer_reports(mut self, report: bool) -> Self {
    self.report_wild_pointers = report;
    self
  }

  #[must_use]
  pub fn with_webserver(mut self, port: u16) -> Self {
    self.webserver = true;
    self.webserver_port = port;
    self
  }
}

/// Renders the settings block shown in reports and on the status page.
impl Display for TrackerConfig {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    writeln!(f, "{name}-{version} ready")?;
    writeln!(f, "with allocs_overhead=x{}", self.allocs_overhead)?;
    writeln!(f, "with max_frames={}", self.max_frames)?;
    writeln!(f, "with skip_begin={}", self.skip_begin)?;
    writeln!(f, "with skip_end={}", self.skip_end)?;
    writeln!(
      f,
      "with report_wild_pointers={}",
      if self.report_wild_pointers { "yes" } else { "no" }
    )?;
    writeln!(
      f,
      "with memset_allocations={}",
      if self.memset_allocations { "yes" } else { "no" }
    )?;
    writeln!(
      f,
      "with report_on_exit={}",
      if self.report_on_exit { "yes" } else { "no" }
    )?;
    writeln!(
      f,
      "with webserver={}",
      if self.webserver { "yes" } else { "no" }
    )?;
    writeln!(f, "with webserver_port={}", self.webserver_port)?;
    write!(
      f,
      "with start_enabled={}",
      if self.start_enabled { "yes" } else { "no" }
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overhead_is_clamped_to_at_least_one() {
    let config = TrackerConfig::default().with_allocs_overhead(0.25);
    assert_eq!(config.allocs_overhead, 1.0);
  }

  #[test]
  fn max_frames_is_capped() {
    let config = TrackerConfig::default().with_max_frames(4096);
    assert_eq!(config.max_frames, MAX_FRAMES);

    let config = TrackerConfig::default().with_max_frames(0);
    assert_eq!(config.max_frames, 1);
  }

  #[test]
  fn settings_block_lists_every_knob() {
    let rendered = TrackerConfig::default().to_string();
    assert!(rendered.contains("allocs_overhead"));
    assert!(rendered.contains("max_frames=128"));
    assert!(rendered.contains("webserver_port=2001"));
  }
}
