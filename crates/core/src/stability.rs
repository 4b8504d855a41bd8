//! Source stability polling.
//!
//! A source that is still being copied or downloaded changes size between
//! polls. The integrity stage waits for two equal readings before probing.

use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the stability window.
    Stable,
    /// File size kept changing for every poll.
    Unstable {
        /// Size at the start of the last poll.
        initial_size: u64,
        /// Size at the end of the last poll.
        current_size: u64,
    },
    /// The run was cancelled while waiting.
    Cancelled,
}

/// Wait until a file's size stops changing.
///
/// Polls up to `retries` times, `wait` apart. The first poll whose size
/// matches the previous reading reports [`StabilityResult::Stable`].
///
/// # Arguments
/// * `path` - Path to the file to check
/// * `wait` - Window the size must stay unchanged for
/// * `retries` - Maximum number of polls
/// * `cancel` - Aborts the wait early
///
/// # Returns
/// * `Ok(StabilityResult::Stable)` if the file size settled
/// * `Ok(StabilityResult::Unstable { .. })` if it changed on every poll
/// * `Ok(StabilityResult::Cancelled)` if cancellation was requested
/// * `Err` if the file cannot be read
pub async fn wait_for_stable(
    path: &Path,
    wait: Duration,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<StabilityResult, std::io::Error> {
    let mut previous = tokio::fs::metadata(path).await?.len();
    if wait.is_zero() || retries == 0 {
        return Ok(StabilityResult::Stable);
    }

    let mut last = StabilityResult::Stable;
    for _ in 0..retries {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(StabilityResult::Cancelled),
            _ = sleep(wait) => {}
        }

        let current = tokio::fs::metadata(path).await?.len();
        last = compare_sizes(previous, current);
        if last == StabilityResult::Stable {
            return Ok(last);
        }
        previous = current;
    }

    Ok(last)
}

/// Classify one poll from the sizes read before and after the wait.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}
