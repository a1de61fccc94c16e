use thiserror::Error;

/// Failures of a feature request. Every variant is terminal for the request
/// that raised it; nothing here is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("malformed feature call '{clause}': {reason}")]
    Parse { clause: String, reason: String },

    #[error("unknown indicator '{name}' in '{call}' (supported: {supported})")]
    UnknownIndicator {
        name: String,
        call: String,
        supported: String,
    },

    #[error("invalid argument in '{call}': {reason}")]
    InvalidArgument { call: String, reason: String },

    #[error("domain error in '{call}': {reason}")]
    Domain { call: String, reason: String },
}

pub type FeatureResult<T> = std::result::Result<T, FeatureError>;

impl FeatureError {
    pub fn parse(clause: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            clause: clause.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(call: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            call: call.into(),
            reason: reason.into(),
        }
    }

    pub fn domain(call: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain {
            call: call.into(),
            reason: reason.into(),
        }
    }

    /// Re-attribute an argument or domain failure raised deep inside an
    /// indicator to the feature call that triggered it.
    pub fn in_call(self, call: &str) -> Self {
        match self {
            Self::InvalidArgument { reason, .. } => Self::invalid(call, reason),
            Self::Domain { reason, .. } => Self::domain(call, reason),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_call_rewrites_argument_and_domain_errors_only() {
        let err = FeatureError::domain("replace_zero_with_min", "no positive values");
        assert_eq!(
            err.in_call("VOLUME_LOG_MA(12,volume)"),
            FeatureError::domain("VOLUME_LOG_MA(12,volume)", "no positive values")
        );

        let parse = FeatureError::parse("SMA(20", "missing ')'");
        assert_eq!(parse.clone().in_call("other"), parse);
    }

    #[test]
    fn messages_name_the_offending_call() {
        let err = FeatureError::invalid("BBANDS(20,2,7,close)", "band must be 1..=4");
        assert_eq!(
            err.to_string(),
            "invalid argument in 'BBANDS(20,2,7,close)': band must be 1..=4"
        );
    }
}
