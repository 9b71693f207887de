// ============================================
// ImageSmith - progress.rs
// ============================================
// Progress reporting for long-running operations.
//
// Mounting or committing a large image can take minutes, so the session
// manager and orchestrator report progress through an injected sink
// instead of printing directly. The console sink reproduces the usual
// "[2/5] Mounting..." output; the null sink is for tests and embedders
// that track progress themselves.
// ============================================

/// Receives progress reports from mount, dismount, and batch operations.
///
/// This is an observability contract, not a correctness one: sinks must
/// tolerate any call order and must never block for long.
pub trait ProgressSink: Send + Sync {
    /// Reports the progress of a single long-running operation.
    ///
    /// `percent` is coarse: 0 when the operation starts, 100 when the
    /// OS call returns. The primitives themselves are opaque blocking
    /// calls, so there is nothing finer to report in between.
    fn report(&self, operation: &str, percent: u8);

    /// Reports which batch item is being worked on.
    fn item(&self, current: usize, total: usize, label: &str);
}

/// Prints progress to the console.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, operation: &str, percent: u8) {
        println!("  {} ({}%)", operation, percent);
    }

    fn item(&self, current: usize, total: usize, label: &str) {
        println!("[{}/{}] {}", current, total, label);
    }
}

/// Discards all progress reports.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _operation: &str, _percent: u8) {}
    fn item(&self, _current: usize, _total: usize, _label: &str) {}
}
