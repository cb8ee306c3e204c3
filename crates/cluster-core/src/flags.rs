use bitflags::bitflags;

bitflags! {
    /// Per-job flags carried from the wire packet tag into the insert job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobFlags: u8 {
        /// The client (or a peer, via `INSERT_TEST_SERVER`) asked for the
        /// test variant of LocalApply regardless of reindex state.
        const TEST = 0b01;
        /// The sender has already run this batch through the test variant
        /// once (`INSERT_TESTED_SERVER`); a receiving pool may apply plainly
        /// even while reindexing.
        const TESTED = 0b10;
    }
}

impl JobFlags {
    /// Whether LocalApply should use the test (re-route/forward) variant:
    /// requested explicitly, or implied by an in-progress reindex that
    /// hasn't been pre-tested by the sender.
    pub fn requires_test_variant(self, reindexing: bool) -> bool {
        self.contains(JobFlags::TEST) || (reindexing && !self.contains(JobFlags::TESTED))
    }
}
