//! Reconciles staged compression results into the store

use tracing::debug;

use super::store::MessageStore;
use super::worker::CompressionResult;

/// Splices finished compression results into a store
pub struct ResultApplier;

impl ResultApplier {
    /// Apply `results` in submission order and return how many were applied.
    ///
    /// A summary takes the place of the earliest of its turns still in the
    /// store; when none are left it goes to the submission-time index,
    /// clamped to the queue. Results from an earlier clear generation than
    /// `epoch` are dropped. Ids that are already gone are skipped. A failed
    /// result removes its turns and inserts nothing.
    pub fn apply(store: &mut MessageStore, results: Vec<CompressionResult>, epoch: u64) -> usize {
        let mut applied = 0;

        for result in results {
            if result.epoch != epoch {
                debug!(
                    result_epoch = result.epoch,
                    epoch, "Discarding result from before the last clear"
                );
                continue;
            }

            let anchor = result
                .message_ids
                .iter()
                .filter_map(|id| store.position(*id))
                .min();
            let removed = result
                .message_ids
                .iter()
                .filter(|id| store.remove(**id).is_some())
                .count();
            store.release(&result.message_ids);

            match result.compressed_msg {
                Some(msg) => {
                    let id = msg.id;
                    let index = store.insert_at(anchor.unwrap_or(result.start_index), msg);
                    debug!(%id, index, removed, "Applied compressed message");
                }
                None => debug!(removed, "Applied failed compression"),
            }
            applied += 1;
        }

        applied
    }
}
