use crate::dev::DevId;

/// Errors returned by registration.
///
/// Lookups never fail; an unresolved device number is reported as `None`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Node storage for the range could not be reserved.
    #[error("out of memory reserving range nodes")]
    OutOfMemory,

    /// Zero span, or a range running past the last device number.
    #[error("invalid range: low={low} span={span}")]
    InvalidRange { low: DevId, span: u32 },
}
