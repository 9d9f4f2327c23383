use thiserror::Error;

/// Error type for configuration query parsing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The key does not match the component configuration grammar
    #[error("bad component configuration key format")]
    BadKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            QueryError::BadKey.to_string(),
            "bad component configuration key format"
        );
    }
}
