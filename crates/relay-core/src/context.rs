//! Context window selection.

/// Returns the trailing `size` entries of `history`, in their original order.
///
/// The source slice is borrowed, never modified. A window larger than the
/// history yields the whole history; a zero window yields nothing.
pub fn window<T>(history: &[T], size: usize) -> &[T] {
    let start = history.len().saturating_sub(size);
    &history[start..]
}
