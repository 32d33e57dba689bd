//! Completion barrier over a download batch.
//!
//! After each successful encode report the worker checks whether every job
//! of the batch has been processed and downloaded. The first worker to see a
//! complete batch claims it, sends the final report and only then commits
//! the batch's processed flag. A failed send gives the claim back, so a later
//! sibling or a retry sends the report instead. The store's compare-and-set
//! guarantees only one of several concurrently finishing siblings holds the
//! claim.

use crate::callback::{CallbackError, CallbackReporter};
use crate::records::{RecordStore, User};
use tracing::{info, warn};

/// Outcome of one barrier evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Some siblings are still outstanding.
    Incomplete { processed: usize, total: usize },
    /// The batch could not be resolved; treated as not complete.
    Unknown,
    /// Complete, but another worker sent or is sending the final report.
    AlreadyReported,
    /// Complete, and this caller holds the claim on the batch.
    Completed { download_id: String },
}

/// Evaluate the barrier for the batch of the first job carrying `mediakey`.
///
/// Lookup failures never propagate: an unresolvable batch is incomplete.
/// On [`BarrierOutcome::Completed`] the caller holds the batch claim and must
/// either commit or release it.
pub fn evaluate_barrier(store: &dyn RecordStore, mediakey: &str) -> BarrierOutcome {
    info!("Check if all downloads are complete for mediakey {}", mediakey);

    let video = match store.video_by_mediakey(mediakey) {
        Ok(video) => video,
        Err(e) => {
            warn!("Cannot resolve batch of mediakey {}: {}", mediakey, e);
            return BarrierOutcome::Unknown;
        }
    };

    let Some(download_id) = video.download_id else {
        return BarrierOutcome::Unknown;
    };

    let counts = match store.batch_counts(&download_id) {
        Ok(counts) => counts,
        Err(e) => {
            warn!("Cannot count batch {}: {}", download_id, e);
            return BarrierOutcome::Unknown;
        }
    };

    if !counts.is_complete() {
        return BarrierOutcome::Incomplete {
            processed: counts.processed,
            total: counts.total,
        };
    }

    info!(
        "All downloads are complete for mediakey {} ({} of {})",
        mediakey, counts.processed, counts.total
    );

    match store.try_claim_download(&download_id) {
        Ok(true) => BarrierOutcome::Completed { download_id },
        Ok(false) => BarrierOutcome::AlreadyReported,
        Err(e) => {
            warn!("Cannot claim download {}: {}", download_id, e);
            BarrierOutcome::Unknown
        }
    }
}

/// Evaluate the barrier and send the final report when this caller wins.
///
/// The batch is committed as processed only after the report was accepted.
pub async fn aggregate(
    store: &dyn RecordStore,
    reporter: &CallbackReporter,
    user: &User,
    mediakey: &str,
) -> Result<BarrierOutcome, CallbackError> {
    let outcome = evaluate_barrier(store, mediakey);
    let BarrierOutcome::Completed { download_id } = &outcome else {
        return Ok(outcome);
    };

    if let Err(e) = reporter.report_finished(user, mediakey).await {
        if let Err(release) = store.release_download_claim(download_id) {
            warn!("Cannot release claim on download {}: {}", download_id, release);
        }
        return Err(e);
    }

    // The held claim keeps siblings from resending if the commit fails.
    if let Err(e) = store.commit_download_processed(download_id) {
        warn!("Cannot commit download {}: {}", download_id, e);
    }
    info!("Final report sent for download {}", download_id);
    Ok(outcome)
}
