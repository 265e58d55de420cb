/// This error indicates an invalid [`crate::SlotId`] was used.
///
/// Within the context of one [`crate::SlotPool`], an id can be invalid if it has never been
/// handed out by that [`crate::SlotPool`], or if its slot has been released since.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct InvalidIdError;

/// This error indicates every slot of a [`crate::SlotPool`] is in use.
///
/// The value that could not be stored is handed back, so the caller keeps ownership of it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExhaustedError<T>(pub T);

impl<T> ExhaustedError<T> {
    /// Returns the value that was rejected.
    pub fn into_inner(self) -> T {
        self.0
    }
}
