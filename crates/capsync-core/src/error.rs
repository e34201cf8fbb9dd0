use thiserror::Error;

/// Whether a failed unit of work may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Failure taxonomy shared by every pipeline stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("unresolved duplicate key on {entity}")]
    DuplicateKeyConflict { entity: &'static str },
    #[error("field `{field}` could not be coerced: {reason}")]
    FieldCoercion { field: &'static str, reason: String },
    #[error("write contention: {0}")]
    Contention(String),
    #[error("provider error: {0}")]
    Api(String),
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::TransientNetwork(_)
            | Self::RateLimitExceeded(_)
            | Self::DuplicateKeyConflict { .. }
            | Self::Contention(_) => RetryDisposition::Retryable,
            Self::MalformedPayload(_)
            | Self::MissingField(_)
            | Self::FieldCoercion { .. }
            | Self::Api(_)
            | Self::Store(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    /// Short stable label for log fields and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::RateLimitExceeded(_) => "rate_limited",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::MissingField(_) => "missing_field",
            Self::DuplicateKeyConflict { .. } => "duplicate_key",
            Self::FieldCoercion { .. } => "field_coercion",
            Self::Contention(_) => "contention",
            Self::Api(_) => "api",
            Self::Store(_) => "store",
        }
    }

    /// Maps a serde decoding failure onto the taxonomy. serde reports absent
    /// required keys as "missing field `name`"; everything else is malformed.
    pub fn from_decode(err: &serde_json::Error) -> Self {
        let message = err.to_string();
        if let Some(rest) = message.strip_prefix("missing field `") {
            if let Some((field, _)) = rest.split_once('`') {
                return Self::MissingField(field.to_string());
            }
        }
        Self::MalformedPayload(message)
    }
}
