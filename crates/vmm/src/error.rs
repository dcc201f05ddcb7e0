//! Error taxonomy shared by every address-space operation.

/// Errors reported by address-space operations and page-fault resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Misaligned, zero-sized or out-of-range input.
    #[error("invalid argument")]
    InvalidArgument,
    /// The requested range collides with an existing area.
    #[error("range overlaps an existing area")]
    Overlap,
    /// No area at the given address.
    #[error("no area at the given address")]
    NotFound,
    /// The area flags or its backend disallow the requested operation.
    #[error("operation not permitted")]
    PermissionDenied,
    /// A frame, an ASID or bookkeeping memory could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// An internal invariant was violated, e.g. a fault on an already resolved page.
    #[error("address space integrity violated")]
    Integrity,
}

impl Error {
    /// Returns true if the error terminates the current task instead of being handed back to
    /// the caller.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Error::Integrity)
    }

    /// Status code reported through the system-call layer.
    pub const fn status(self) -> isize {
        match self {
            Error::NotFound => -1,
            Error::OutOfMemory => -2,
            Error::PermissionDenied => -6,
            Error::Overlap => -11,
            Error::InvalidArgument => -13,
            Error::Integrity => -15,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_integrity_is_fatal() {
        assert!(Error::Integrity.is_fatal());
        assert!(!Error::NotFound.is_fatal());
        assert!(!Error::OutOfMemory.is_fatal());
    }

    #[test]
    fn status_codes_are_negative() {
        for err in [
            Error::InvalidArgument,
            Error::Overlap,
            Error::NotFound,
            Error::PermissionDenied,
            Error::OutOfMemory,
            Error::Integrity,
        ] {
            assert!(err.status() < 0, "{err} maps to a non-negative status");
        }
    }
}
