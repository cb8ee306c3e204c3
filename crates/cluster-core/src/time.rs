/// The unit a database's timestamps are configured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

/// The validity range a decoded timestamp must fall within, derived from a
/// database's time-precision configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePrecision {
    pub unit: TimeUnit,
    pub min: i64,
    pub max: i64,
}

impl TimePrecision {
    pub fn new(unit: TimeUnit, min: i64, max: i64) -> Self {
        TimePrecision { unit, min, max }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.min && ts <= self.max
    }

    /// A permissive range used by tests and the default service config.
    pub fn unbounded_seconds() -> Self {
        TimePrecision::new(TimeUnit::Seconds, 0, i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_inclusive_on_both_ends() {
        let p = TimePrecision::new(TimeUnit::Seconds, 10, 20);
        assert!(p.contains(10));
        assert!(p.contains(20));
        assert!(!p.contains(9));
        assert!(!p.contains(21));
    }
}
