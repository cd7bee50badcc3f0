use std::path::PathBuf;

use tracing::warn;

use crate::{Result, TrackMetadata};

/// Outbound notification sent once per published edit, e.g. to a catalog
/// API. Failures are the collaborator's to handle; the engine logs them and
/// moves on.
pub trait MetadataReporter: Send + Sync {
    fn report(
        &self,
        job_id: &str,
        edit_label: &str,
        files: &[PathBuf],
        tags: &TrackMetadata,
    ) -> Result<()>;
}

/// Sends one report and logs a failure. Never retries and never fails the
/// caller; returns whether the report was acknowledged.
pub(crate) fn deliver(
    reporter: &dyn MetadataReporter,
    job_id: &str,
    edit_label: &str,
    files: &[PathBuf],
    tags: &TrackMetadata,
) -> bool {
    match reporter.report(job_id, edit_label, files, tags) {
        Ok(()) => true,
        Err(err) => {
            warn!(job_id, edit = edit_label, %err, "metadata report failed");
            false
        }
    }
}
