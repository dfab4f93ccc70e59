//! Optimistic concurrency primitives shared by every persisted record.

/// A record carrying a monotonically increasing version (`mvcc`).
///
/// Version `0` means "never persisted". Every successful write bumps the
/// version by exactly one.
pub trait Versioned {
    fn mvcc(&self) -> u64;

    fn set_mvcc(&mut self, mvcc: u64);
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (administrative overwrites, migrations).
    Any,
    /// Require the record to be at an exact version. `Exact(0)` requires the
    /// record to be absent.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation that the record does not exist yet.
    pub const ABSENT: ExpectedVersion = ExpectedVersion::Exact(0);

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
