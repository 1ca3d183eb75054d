use crate::model::*;
use crate::store::StoreError;

/// Blocking reservations of the field whose windows overlap `span`, in start
/// order. Cancelled and completed reservations never conflict.
pub fn conflicts<'a>(fs: &'a FieldState, span: &Span) -> impl Iterator<Item = &'a Reservation> {
    fs.overlapping(span).filter(|r| r.blocks())
}

/// Fail with the first conflicting reservation, skipping `ignore` (the
/// reservation being re-admitted, when a status change makes it blocking again).
pub fn check_no_conflict(
    fs: &FieldState,
    span: &Span,
    ignore: Option<Id>,
) -> Result<(), StoreError> {
    match conflicts(fs, span).find(|r| Some(r.id) != ignore) {
        Some(existing) => Err(StoreError::Conflict(existing.id)),
        None => Ok(()),
    }
}
