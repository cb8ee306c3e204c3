/// The decode/repack error taxonomy from the insert wire contract.
///
/// Every variant is surfaced to the client as a distinct error response and,
/// at the one boundary that must hand back a plain integer (mirroring the
/// original ABI), maps to a negative code via [`DecodeError::wire_code`] —
/// callers must not confuse a negative code with a valid point count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("points container was not an array")]
    ExpectingArray,
    #[error("expected a series name")]
    ExpectingSeriesName,
    #[error("top-level value was neither a map nor an array")]
    ExpectingMapOrArray,
    #[error("point timestamp was not an integer")]
    ExpectingIntegerTs,
    #[error("timestamp outside the database's valid range")]
    TimestampOutOfRange,
    #[error("point value was not integer, float, or raw bytes")]
    UnsupportedValue,
    #[error("points array must contain at least one point")]
    ExpectingAtLeastOnePoint,
    #[error("array-form element is missing 'name' or 'points'")]
    ExpectingNameAndPoints,
    /// Reserved for the original ABI's allocation-failure code. Safe Rust's
    /// `Vec` growth aborts the process rather than handing back a `Result`,
    /// so this variant has no construction site in this workspace; it is
    /// kept only so [`DecodeError::wire_code`] still reproduces all nine
    /// codes from the source taxonomy.
    #[error("allocation failure")]
    MemAlloc,
    /// A prior critical failure already tripped this job's `ErrorBus`;
    /// decode aborts before touching any buffer.
    #[error("error bus already tripped by a prior failure in this job")]
    BusAlreadyTripped,
}

impl DecodeError {
    /// The negative wire code for this error, matching the source ABI's
    /// "errors are negative integers, never confused with a point count"
    /// contract.
    pub fn wire_code(self) -> i32 {
        match self {
            DecodeError::ExpectingArray => -1,
            DecodeError::ExpectingSeriesName => -2,
            DecodeError::ExpectingMapOrArray => -3,
            DecodeError::ExpectingIntegerTs => -4,
            DecodeError::TimestampOutOfRange => -5,
            DecodeError::UnsupportedValue => -6,
            DecodeError::ExpectingAtLeastOnePoint => -7,
            DecodeError::ExpectingNameAndPoints => -8,
            DecodeError::MemAlloc => -9,
            DecodeError::BusAlreadyTripped => -10,
        }
    }
}

/// A storage-engine failure severe enough to trip the `ErrorBus`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("critical error: {reason}")]
pub struct Critical {
    pub reason: String,
}

impl Critical {
    pub fn new(reason: impl Into<String>) -> Self {
        Critical {
            reason: reason.into(),
        }
    }
}
