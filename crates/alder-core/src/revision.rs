//! Pure revision arithmetic shared by initial sync and the watch path.

/// Baseline revision after a full range read.
///
/// The range response header revision can exceed every key's ModRevision
/// (for example after pure deletes); the baseline must still advance past
/// those, or the watch would replay delete events the table never saw.
pub fn baseline_revision(header_revision: i64, max_mod_revision: i64) -> i64 {
    header_revision.max(max_mod_revision)
}

/// Start revision for a watch resuming after `cursor`.
///
/// A zero cursor means no history is known; watching from revision 0 asks
/// the server for "current state onward" rather than a replay.
pub fn next_watch_revision(cursor: i64) -> i64 {
    if cursor > 0 { cursor + 1 } else { 0 }
}
