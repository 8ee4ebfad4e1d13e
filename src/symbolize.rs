use std::ffi::{c_void, OsStr};
use std::path::Path;

use crate::stack::FramePtr;

/// Sentinel emitted for frames the platform symbolizer cannot resolve.
pub const UNRESOLVED: &str = "????";

/// Resolves a batch of frame pointers into human-readable names.
///
/// Symbolization is expensive, so it runs at report time only and over the
/// whole batch at once; the result always has one entry per input frame.
/// Frames without debug information resolve to [`UNRESOLVED`].
#[must_use]
pub fn resolve_batch(frames: &[FramePtr]) -> Vec<String> {
  frames.iter().map(|&frame| resolve_one(frame)).collect()
}

fn resolve_one(frame: FramePtr) -> String {
  let mut resolved: Option<String> = None;

  backtrace::resolve(frame as *mut c_void, |symbol| {
    if resolved.is_some() {
      return;
    }

    let name = symbol.name().map(|name| format!("{name}"));
    let filename = symbol.filename().and_then(path_to_string);
    let lineno = symbol.lineno();

    resolved = match (name, filename, lineno) {
      (Some(name), Some(file), Some(line)) => {
        Some(format!("{name} ({file}, line {line})"))
      }
      (Some(name), _, _) => Some(name),
      _ => None,
    };
  });

  resolved.unwrap_or_else(|| UNRESOLVED.to_string())
}

fn path_to_string(path: &Path) -> Option<String> {
  path
    .to_str()
    .or_else(|| path.file_name().and_then(OsStr::to_str))
    .map(str::to_string)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stack::Callstack;

  #[test]
  fn zero_frames_resolve_to_zero_names() {
    assert!(resolve_batch(&[]).is_empty());
  }

  #[test]
  fn output_length_matches_input_length() {
    let stack = Callstack::capture(0, 8);
    let names = resolve_batch(stack.frames());
    assert_eq!(names.len(), stack.len());
  }

  #[test]
  fn unknown_addresses_resolve_to_the_sentinel() {
    // Address 0x1 is never mapped to a symbol.
    let names = resolve_batch(&[0x1]);
    assert_eq!(names, vec![UNRESOLVED.to_string()]);
  }
}
