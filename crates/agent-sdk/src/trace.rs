/// Lightweight diagnostic output abstraction.
///
/// Components take a `TraceWriter` rather than a concrete sink so that the
/// listener, the worker, and tests can each route diagnostics their own way.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("##[warning]{message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("##[error]{message}"));
    }
}

/// A trace writer that forwards to the `tracing` crate at matching levels.
#[derive(Debug, Clone)]
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!("{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }
}

/// A no-op trace writer that discards all messages. Useful for tests.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// A trace writer that collects all messages into a `Vec` for assertions.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

/// The level of a collected trace message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// Return only the message text, in order.
    pub fn lines(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, m)| m.clone()).collect()
    }

    /// Clear collected messages.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.messages
            .lock()
            .push((TraceLevel::Info, message.to_string()));
    }

    fn verbose(&self, message: &str) {
        self.messages
            .lock()
            .push((TraceLevel::Verbose, message.to_string()));
    }

    fn warning(&self, message: &str) {
        self.messages
            .lock()
            .push((TraceLevel::Warning, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.messages
            .lock()
            .push((TraceLevel::Error, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer_preserves_order() {
        let writer = CollectingTraceWriter::new();
        writer.info("hello");
        writer.warning("warn");
        writer.error("err");
        let msgs = writer.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], (TraceLevel::Info, "hello".into()));
        assert_eq!(msgs[1], (TraceLevel::Warning, "warn".into()));
        assert_eq!(msgs[2], (TraceLevel::Error, "err".into()));
    }

    #[test]
    fn null_writer_does_not_panic() {
        let writer = NullTraceWriter;
        writer.info("test");
        writer.verbose("test");
        writer.warning("test");
        writer.error("test");
    }
}
