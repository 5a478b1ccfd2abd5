use core::fmt;

/// Returned when an operation requires CPU Lock to be inactive but it is
/// currently active.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum BadContextError {
    BadContext,
}

impl fmt::Debug for BadContextError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("BadContext")
    }
}
