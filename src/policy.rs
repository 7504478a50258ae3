use tracing::warn;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Whole megabytes, rounded down, as shown in log entries.
pub fn to_mb(bytes: u64) -> u64 {
    bytes / BYTES_PER_MB
}

/// Decision returned by the ceiling policy after a resident memory read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    /// At or below the ceiling; keep polling.
    WithinLimit,
    /// Above the ceiling; kill and restart.
    Violation { rss_bytes: u64, over_by: u64 },
}

/// Compares resident memory reads against the ceiling.
///
/// Only a strictly greater reading is a violation; sitting exactly on the
/// ceiling is allowed.
pub struct CeilingPolicy {
    ceiling_bytes: u64,
}

impl CeilingPolicy {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self { ceiling_bytes }
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    pub fn evaluate(&self, rss_bytes: u64) -> PollDecision {
        if rss_bytes <= self.ceiling_bytes {
            return PollDecision::WithinLimit;
        }

        let over_by = rss_bytes - self.ceiling_bytes;
        warn!(
            rss_bytes,
            ceiling_bytes = self.ceiling_bytes,
            over_by,
            "memory ceiling exceeded"
        );
        PollDecision::Violation { rss_bytes, over_by }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_within_limit_below_ceiling() {
        let policy = CeilingPolicy::new(200 * MIB);
        assert_eq!(policy.evaluate(50 * MIB), PollDecision::WithinLimit);
        assert_eq!(policy.evaluate(150 * MIB), PollDecision::WithinLimit);
    }

    #[test]
    fn test_exact_ceiling_is_within_limit() {
        let policy = CeilingPolicy::new(200 * MIB);
        assert_eq!(policy.evaluate(200 * MIB), PollDecision::WithinLimit);
    }

    #[test]
    fn test_one_byte_over_is_violation() {
        let policy = CeilingPolicy::new(200 * MIB);
        assert_eq!(
            policy.evaluate(200 * MIB + 1),
            PollDecision::Violation {
                rss_bytes: 200 * MIB + 1,
                over_by: 1
            }
        );
    }

    #[test]
    fn test_violation_reports_overshoot() {
        let policy = CeilingPolicy::new(200 * MIB);
        assert_eq!(
            policy.evaluate(210 * MIB),
            PollDecision::Violation {
                rss_bytes: 210 * MIB,
                over_by: 10 * MIB
            }
        );
    }

    #[test]
    fn test_zero_reading_never_violates() {
        let policy = CeilingPolicy::new(1);
        assert_eq!(policy.evaluate(0), PollDecision::WithinLimit);
    }

    #[test]
    fn test_to_mb_rounds_down() {
        assert_eq!(to_mb(210 * MIB), 210);
        assert_eq!(to_mb(210 * MIB + MIB - 1), 210);
        assert_eq!(to_mb(MIB - 1), 0);
    }
}
