use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use logtest::Logger;
use rstest::fixture;

/// Exclusive handle to the process-wide log capture.
///
/// [`logtest::Logger`] installs itself as the global `log` sink, so only
/// one test may inspect records at a time. Holding a `LoggerHandle`
/// serialises that access. Acquisition recovers a poisoned lock (a test
/// that panicked mid-capture must not wedge the rest of the suite) and
/// discards records left behind by earlier tests.
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the capture with a clean record queue.
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut handle = Self {
            guard: logger.lock().unwrap_or_else(PoisonError::into_inner),
        };
        handle.clear();
        handle
    }

    /// Discard every record captured so far.
    pub fn clear(&mut self) {
        while self.guard.pop().is_some() {}
    }

    /// Drain the captured records into their formatted messages.
    pub fn drain_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(record) = self.guard.pop() {
            messages.push(record.args().to_string());
        }
        messages
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
