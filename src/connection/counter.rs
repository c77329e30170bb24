//! Process-wide connection gauge.

use std::sync::atomic::{AtomicU64, Ordering};

static ACTIVE: AtomicU64 = AtomicU64::new(0);

/// Guard holding one slot in the gauge.
///
/// Created when a connection's tasks start and dropped by the reader task
/// on exit, so the gauge reflects connections whose teardown has completed.
pub(super) struct ActiveConnection;

impl ActiveConnection {
    pub(super) fn new() -> Self {
        ACTIVE.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        ACTIVE.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Number of connections currently open in this process.
#[must_use]
pub fn active_connection_count() -> u64 {
    ACTIVE.load(Ordering::Relaxed)
}
