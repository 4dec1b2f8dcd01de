//! First fatal flush error of a run.

use std::sync::OnceLock;

use rapidbyte_types::error::ConnectorError;

/// Records the first flush failure. Later failures are logged and dropped.
#[derive(Debug, Default)]
pub struct FlushFailure {
    first: OnceLock<ConnectorError>,
}

impl FlushFailure {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `error` if no failure was recorded yet. Returns `true` when this
    /// call won.
    pub fn record_failure(&self, error: ConnectorError) -> bool {
        match self.first.set(error) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(error = %error, "Ignoring flush failure after the first");
                false
            }
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.first.get().is_some()
    }

    #[must_use]
    pub fn error(&self) -> Option<ConnectorError> {
        self.first.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_healthy() {
        let failure = FlushFailure::new();
        assert!(!failure.is_failed());
        assert!(failure.error().is_none());
    }

    #[test]
    fn first_writer_wins() {
        let failure = FlushFailure::new();
        assert!(failure.record_failure(ConnectorError::transient_db("E1", "first")));
        assert!(!failure.record_failure(ConnectorError::internal("E2", "second")));
        assert!(failure.is_failed());
        assert_eq!(failure.error().unwrap().code, "E1");
    }

    #[test]
    fn concurrent_writers_keep_exactly_one() {
        let failure = Arc::new(FlushFailure::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let failure = Arc::clone(&failure);
                std::thread::spawn(move || {
                    failure.record_failure(ConnectorError::internal(format!("E{i}"), "boom"))
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(failure.is_failed());
    }
}
