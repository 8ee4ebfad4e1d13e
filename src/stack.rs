use smallvec::SmallVec;

/// Opaque instruction-pointer value identifying one activation record.
pub type FramePtr = usize;

/// Hard cap on captured frames per callstack.
pub const MAX_FRAMES: usize = 128;

const STACK_INLINE_DEPTH: usize = 32;

type FrameBuffer = SmallVec<[FramePtr; STACK_INLINE_DEPTH]>;

/// An ordered sequence of return addresses captured at one point in time.
///
/// Frames are stored most-recent first, the order the unwinder yields them.
/// Callstacks are immutable after capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Callstack {
  frames: FrameBuffer,
}

impl Callstack {
  /// Captures the current thread's return-address chain.
  ///
  /// The topmost `skip` frames are omitted so the capture machinery does not
  /// show up in its own traces. At most `max` frames are recorded, capped at
  /// [`MAX_FRAMES`]. Returns an empty callstack when `skip > max` or when
  /// unwinding is unavailable on the platform; callers must tolerate this.
  #[must_use]
  pub fn capture(skip: usize, max: usize) -> Self {
    let max = max.min(MAX_FRAMES);
    let mut frames = FrameBuffer::new();

    if max == 0 || skip > max {
      return Self { frames };
    }

    let mut remaining_skip = skip;

    backtrace::trace(|frame| {
      if remaining_skip > 0 {
        remaining_skip -= 1;
        return true;
      }

      if frames.len() >= max {
        return false;
      }

      frames.push(frame.ip() as FramePtr);

      true
    });

    Self { frames }
  }

  /// Builds a callstack from pre-existing frame values, most-recent first.
  #[must_use]
  pub fn from_frames<I>(frames: I) -> Self
  where
    I: IntoIterator<Item = FramePtr>,
  {
    Self {
      frames: frames.into_iter().take(MAX_FRAMES).collect(),
    }
  }

  #[must_use]
  pub fn frames(&self) -> &[FramePtr] {
    &self.frames
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.frames.len()
  }

  /// The frames left after eliding `skip_begin` from the most-recent end and
  /// `skip_end` from the oldest end. Empty when nothing survives.
  #[must_use]
  pub fn trimmed(&self, skip_begin: usize, skip_end: usize) -> &[FramePtr] {
    let len = self.frames.len();

    if skip_begin.saturating_add(skip_end) >= len {
      return &[];
    }

    &self.frames[skip_begin..len - skip_end]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn capture_honors_the_depth_cap() {
    let stack = Callstack::capture(0, 4);
    assert!(stack.len() <= 4);
  }

  #[test]
  fn capture_returns_frames_on_supported_platforms() {
    let stack = Callstack::capture(0, MAX_FRAMES);
    assert!(!stack.is_empty());
  }

  #[test]
  fn skip_beyond_max_yields_an_empty_callstack() {
    let stack = Callstack::capture(8, 4);
    assert!(stack.is_empty());
  }

  #[test]
  fn skipped_frames_are_elided() {
    let full = Callstack::capture(0, MAX_FRAMES);
    let skipped = Callstack::capture(2, MAX_FRAMES);
    assert!(skipped.len() <= full.len());
  }

  #[test]
  fn trimmed_drops_both_ends() {
    let stack = Callstack::from_frames([0x10, 0x20, 0x30, 0x40]);
    assert_eq!(stack.trimmed(1, 1), &[0x20, 0x30]);
    assert_eq!(stack.trimmed(0, 0), stack.frames());
    assert!(stack.trimmed(3, 2).is_empty());
  }

  #[test]
  fn from_frames_caps_at_max() {
    let stack = Callstack::from_frames((0..MAX_FRAMES + 16).map(|i| i + 1));
    assert_eq!(stack.len(), MAX_FRAMES);
  }
}
