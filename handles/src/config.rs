/// Per-store settings, fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct HandleConfig {
    /// Log store life cycle events (creation, block growth, scope exit,
    /// reset, teardown) at debug level.
    pub trace_handles: bool,
}

impl HandleConfig {
    pub fn traced() -> Self {
        Self {
            trace_handles: true,
        }
    }
}
