use std::alloc::{handle_alloc_error, Layout};
use std::fmt::{self, Display, Formatter};
use std::io;

/// Errors that can occur while generating or opening a leak report.
#[derive(Debug)]
pub enum TrackerError {
  Io(io::Error),
  Json(serde_json::Error),
  /// The operation was requested from inside the tracker's own machinery,
  /// where tracking events are skipped rather than serviced.
  Reentrant,
}

impl Display for TrackerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during report: {err}"),
      Self::Json(err) => write!(f, "failed to encode stats as json: {err}"),
      Self::Reentrant => {
        write!(f, "operation requested from inside the tracker core")
      }
    }
  }
}

impl std::error::Error for TrackerError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
      Self::Reentrant => None,
    }
  }
}

impl From<io::Error> for TrackerError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for TrackerError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Fatal path for unrecoverable initialization failures.
///
/// Continuing after one of these would silently drop every future tracking
/// event, so the process stops here.
pub fn fail(message: &str) -> ! {
  log::error!("{message}");
  panic!("{message}");
}

/// Fatal path for out-of-memory reported by the system allocator.
pub fn badalloc(layout: Layout) -> ! {
  handle_alloc_error(layout)
}
