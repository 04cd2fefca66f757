//! Sparse ordering keys for items inside a group.
//!
//! New items are appended with a gap of [`POSITION_GAP`]; a reorder takes the
//! midpoint of its new neighbours so no sibling has to move.

pub const POSITION_GAP: f64 = 1000.0;

/// Position for an item appended after every existing sibling.
pub fn next_position(siblings: impl IntoIterator<Item = f64>) -> f64 {
    siblings
        .into_iter()
        .fold(None, |max: Option<f64>, p| Some(max.map_or(p, |m| m.max(p))))
        .map_or(POSITION_GAP, |max| max + POSITION_GAP)
}

/// Position for an item dropped between `prev` and `next`.
///
/// `None` on either side means the list edge.
pub fn position_between(prev: Option<f64>, next: Option<f64>) -> f64 {
    match (prev, next) {
        (Some(a), Some(b)) => (a + b) / 2.0,
        (None, Some(first)) => {
            let head = (first / 2.0).floor();
            if head < first {
                head
            } else {
                first - POSITION_GAP
            }
        }
        (Some(last), None) => last + POSITION_GAP,
        (None, None) => POSITION_GAP,
    }
}

/// Whether `candidate` still sorts strictly between its neighbours. Fails once
/// repeated midpoint insertion runs out of float precision.
pub fn fits_between(candidate: f64, prev: Option<f64>, next: Option<f64>) -> bool {
    prev.map_or(true, |p| candidate > p) && next.map_or(true, |n| candidate < n)
}

/// Fresh evenly spaced positions for `count` siblings.
pub fn rebalance(count: usize) -> Vec<f64> {
    (1..=count).map(|i| i as f64 * POSITION_GAP).collect()
}
