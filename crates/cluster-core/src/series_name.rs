use std::fmt;

/// Compile-time bound on series name length, matching the original ABI's
/// fixed-size name buffer.
pub const SERIES_NAME_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SeriesNameError {
    #[error("series name must not be empty")]
    Empty,
    #[error("series name length {0} exceeds SERIES_NAME_MAX ({SERIES_NAME_MAX})")]
    TooLong(usize),
}

/// A validated, non-empty series name.
///
/// Series names are raw bytes on the wire — no null-termination assumption,
/// no UTF-8 requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesName(Vec<u8>);

impl SeriesName {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SeriesNameError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(SeriesNameError::Empty);
        }
        if bytes.len() >= SERIES_NAME_MAX {
            return Err(SeriesNameError::TooLong(bytes.len()));
        }
        Ok(SeriesName(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SeriesName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert_eq!(SeriesName::new(Vec::new()), Err(SeriesNameError::Empty));
    }

    #[test]
    fn rejects_oversized_name() {
        let bytes = vec![b'a'; SERIES_NAME_MAX];
        assert_eq!(
            SeriesName::new(bytes),
            Err(SeriesNameError::TooLong(SERIES_NAME_MAX))
        );
    }

    #[test]
    fn accepts_name_one_below_max() {
        let bytes = vec![b'a'; SERIES_NAME_MAX - 1];
        assert!(SeriesName::new(bytes).is_ok());
    }
}
