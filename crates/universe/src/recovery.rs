//! Cold-start path: replaying the data file into a fresh [`State`].
//!
//! Every record is applied in file order through [`State::expansion_read`].
//! A record cut short by a crash is either reported or, when repair is
//! enabled, cut off the file. Afterwards every slot still pending is emptied,
//! since the commit that would have filled it never completed.

use atomfile::{AtomDataFile, AtomDataFileError, ReadSummary};
use tracing::{info, warn};

use crate::State;

/// Replays `file` into `state`.
///
/// # Errors
///
/// Propagates every data file error except a torn last record when
/// `repair_torn_tail` is set and the file is writable.
pub fn replay_into_state(
    file: &mut AtomDataFile,
    state: &State,
    repair_torn_tail: bool,
) -> Result<ReadSummary, AtomDataFileError> {
    let mut applied = ReadSummary {
        end_offset: file.len(),
        ..ReadSummary::default()
    };

    let result = file.read_all(|record| {
        applied.records += 1;
        applied.atoms += record.atoms.len() as u64;
        state.expansion_read(record)
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(AtomDataFileError::Truncated { offset }) if repair_torn_tail && !file.is_read_only() => {
            warn!(
                path = %file.path().display(),
                offset,
                dropped = file.len() - offset,
                "truncating torn record at end of data file"
            );
            file.truncate(offset)?;
            ReadSummary {
                end_offset: offset,
                ..applied
            }
        }
        Err(e) => return Err(e),
    };

    let cleaned = state.clean_pending_atoms();
    info!(
        records = summary.records,
        atoms = summary.atoms,
        cleaned,
        ucn = state.ucn(),
        "replayed data file"
    );
    Ok(summary)
}
