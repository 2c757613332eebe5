//! Override & flag engine. Operators attach PROTECT/DELETE/RESEARCH markers
//! to a `message_id`; `evaluate` resolves all flags on a message into a
//! single verdict the processing controller must obey ahead of the classifier.

use crate::models::{FlagEvaluation, FlagType, OverrideFlag};

/// Resolve every flag attached to one `message_id` into a single evaluation.
///
/// Precedence: PROTECT beats everything (veto), DELETE forces disposition
/// absent a PROTECT, RESEARCH is advisory only and never changes disposition.
/// A PROTECT+DELETE pair on the same message is legal but surfaces a
/// `FlagConflict` warning upstream; PROTECT still wins here.
pub fn evaluate(flags: &[OverrideFlag]) -> FlagEvaluation {
    let has_protect = flags.iter().any(|f| f.flag_type == FlagType::Protect);
    let has_delete = flags.iter().any(|f| f.flag_type == FlagType::Delete);
    let has_research = flags.iter().any(|f| f.flag_type == FlagType::Research);

    if has_protect {
        FlagEvaluation::VetoDelete
    } else if has_delete {
        FlagEvaluation::ForceDelete
    } else if has_research {
        FlagEvaluation::AdvisoryResearch
    } else {
        FlagEvaluation::None
    }
}

/// True when a PROTECT and DELETE flag are simultaneously present, the one
/// conflict condition the controller must log via `SentinelError::FlagConflict`.
pub fn has_conflict(flags: &[OverrideFlag]) -> bool {
    let has_protect = flags.iter().any(|f| f.flag_type == FlagType::Protect);
    let has_delete = flags.iter().any(|f| f.flag_type == FlagType::Delete);
    has_protect && has_delete
}
