use std::sync::Arc;

/// Categorized transport failures. Everything else is propagated as plain `anyhow::Error`, so
///  callers that care about the category use `downcast_ref::<TransportError>()`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no transport registered for shorthand '{0}'")]
    UnknownShorthand(String),

    #[error("invalid transport expression '{expression}': {reason}")]
    InvalidExpression {
        expression: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport '{0}' is not running")]
    NotRunning(String),

    #[error("transport '{0}' received data but has no receive handler")]
    NoHandler(String),

    #[error("receive handler of transport '{transport}' panicked on data from {sender}: {message}")]
    HandlerPanicked {
        transport: String,
        sender: String,
        message: String,
    },

    /// Aggregate startup failure of a [crate::transport::mux::MuxTransport]: one entry per child
    ///  that failed to open. All children were stopped again before this was returned.
    #[error("{} transport(s) failed to start: {}", .0.len(), join_errors(.0))]
    StartFailed(Vec<Arc<anyhow::Error>>),
}

impl TransportError {
    pub fn invalid_expression(expression: &str, reason: impl Into<String>) -> TransportError {
        TransportError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

fn join_errors(errors: &[Arc<anyhow::Error>]) -> String {
    errors.iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failed_display_lists_all_causes() {
        let err = TransportError::StartFailed(vec![
            Arc::new(anyhow::anyhow!("connection refused")),
            Arc::new(anyhow::anyhow!("address in use")),
        ]);
        assert_eq!(err.to_string(), "2 transport(s) failed to start: connection refused; address in use");
    }
}
