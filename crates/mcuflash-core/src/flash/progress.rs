//! Progress reporting
//!
//! The engine never prints. Long operations report through a
//! [`FlashObserver`]; the CLI renders it as progress bars, tests and library
//! users pass [`NoProgress`].

/// Statistics from a write operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Number of bytes programmed
    pub bytes_written: usize,
    /// Number of sectors erased
    pub sectors_erased: usize,
    /// Whether the sector-by-sector fallback was needed
    pub used_fallback: bool,
}

/// Observer for long-running flash operations
pub trait FlashObserver {
    /// Called when starting to read flash contents
    fn reading(&mut self, total_bytes: usize);

    /// Called to update read progress
    fn read_progress(&mut self, bytes_read: usize);

    /// Called when starting erase operations
    fn erasing(&mut self, sectors_to_erase: usize);

    /// Called after each sector (or pulse-verify batch) is erased
    fn erase_progress(&mut self, sectors_erased: usize);

    /// Called when starting to program
    fn writing(&mut self, bytes_to_write: usize);

    /// Called to update program progress
    fn write_progress(&mut self, bytes_written: usize);

    /// Called when a write operation finishes
    fn complete(&mut self, stats: &WriteStats);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashObserver for NoProgress {
    fn reading(&mut self, _total_bytes: usize) {}
    fn read_progress(&mut self, _bytes_read: usize) {}
    fn erasing(&mut self, _sectors_to_erase: usize) {}
    fn erase_progress(&mut self, _sectors_erased: usize) {}
    fn writing(&mut self, _bytes_to_write: usize) {}
    fn write_progress(&mut self, _bytes_written: usize) {}
    fn complete(&mut self, _stats: &WriteStats) {}
}
