use super::{entry::MergeCommitEntry, error::MergeError, log_entry::MergeObjectsEntry};
use crate::{
    catalog::Transaction,
    object::ObjectEntry,
    observability::log_debug,
};

/// Publish a merge in `txn`: soft-delete the merged objects, create the new
/// objects with their stats, and log a [`MergeObjectsEntry`].
///
/// Stops at the first failure. Effects already staged stay in the
/// transaction's write set and are discarded with it on rollback.
pub fn handle_merge_entry_in_txn(
    txn: &dyn Transaction,
    entry: &MergeCommitEntry,
) -> Result<Vec<ObjectEntry>, MergeError> {
    let relation = txn.database(entry.db_id)?.relation(entry.table_id)?;

    let mut merged = Vec::with_capacity(entry.merged_objects.len());
    for stats in &entry.merged_objects {
        let object = relation.object(&stats.id())?;
        merged.push(object.entry());
        relation.soft_delete_object(&stats.id())?;
    }

    let mut created = Vec::with_capacity(entry.created_objects.len());
    for stats in &entry.created_objects {
        let object = relation.create_non_appendable_object(stats.id())?;
        object.update_stats(stats.clone())?;
        if stats.is_sorted() {
            object.set_sorted()?;
        }
        created.push(object.entry());
    }

    let log = MergeObjectsEntry::new(
        entry.db_id,
        entry.table_id,
        entry.start_ts,
        merged,
        created.clone(),
        entry.booking.clone(),
    );
    log_debug!(
        component = "merge_apply",
        event = "merge_logged",
        table = %entry.table_name,
        entry = %log,
    );
    txn.log_entry(entry.db_id, entry.table_id, log)?;
    Ok(created)
}
