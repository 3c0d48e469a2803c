use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::guard::ConcurrencyGuard;
use crate::repository::WalRepository;

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);
const LOCK_PRUNE_PERIOD: Duration = Duration::from_secs(60);

/// Compact the WAL whenever enough appends have piled up since the last compaction.
pub async fn run_compactor(repo: Arc<WalRepository>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_PERIOD);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&repo, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// One compactor tick. Returns the number of records written, if it compacted.
pub async fn compact_if_needed(
    repo: &WalRepository,
    threshold: u64,
) -> Result<Option<usize>, crate::repository::RepositoryError> {
    let appends = repo.appends_since_compact().await?;
    if appends < threshold {
        return Ok(None);
    }
    let records = repo.compact().await?;
    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
    info!(appends, records, "WAL compacted");
    Ok(Some(records))
}

/// Periodically forget provider locks that nobody holds.
pub async fn run_lock_pruner(guard: Arc<ConcurrencyGuard>) {
    let mut interval = tokio::time::interval(LOCK_PRUNE_PERIOD);
    loop {
        interval.tick().await;
        let pruned = guard.prune_idle();
        if pruned > 0 {
            debug!(pruned, "pruned idle provider locks");
        }
    }
}
