use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Inventory client error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Consumer engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Failures reported by the broker client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to subscribe to topics {topics}: {reason}")]
    Subscription { topics: String, reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Consumer is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("required headers are missing which would result in message processing failures: {found}")]
    MissingHeaders { found: String },

    #[error("unsupported api version: {version}")]
    UnsupportedVersion { version: String },

    #[error("error unmarshaling message envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("message envelope has no payload")]
    MissingPayload,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("error unmarshaling change event: {reason}")]
    InvalidMessage { reason: String },

    #[error("error unmarshaling request payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("invalid groups field: {reason}")]
    InvalidGroups { reason: String },

    #[error("missing required membership entry for resource {resource_id}")]
    MissingMembership { resource_id: String },

    #[error("tombstone message has no key to extract resource ID")]
    MissingKey,

    #[error("error unmarshaling message key for tombstone: {reason}")]
    InvalidKey { reason: String },

    #[error("cannot extract resource ID from message")]
    MissingResourceId,
}

/// Failures of a single call against the inventory service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("resource not found: {message}")]
    NotFound { message: String },

    #[error("rpc failed with {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("inventory client is disabled")]
    Disabled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("max retries reached after {attempts} attempt(s): {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] BrokerError),

    #[error("error in consumer shutdown: {0}")]
    Shutdown(#[source] BrokerError),

    #[error("fatal broker error: {code}: {reason}")]
    BrokerFatal { code: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("consumer restarted {restarts} time(s) without recovering")]
    RestartsExhausted { restarts: u32 },

    #[error("failed to create consumer: {0}")]
    ConsumerCreation(#[source] BrokerError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;

impl From<serde_json::Error> for TransformError {
    fn from(err: serde_json::Error) -> Self {
        TransformError::InvalidMessage {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

impl From<tonic::Status> for UpstreamError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => UpstreamError::NotFound {
                message: status.message().to_string(),
            },
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => UpstreamError::Auth {
                reason: status.message().to_string(),
            },
            code => UpstreamError::Rpc {
                code: format!("{code:?}"),
                message: status.message().to_string(),
            },
        }
    }
}

impl UpstreamError {
    /// True when the inventory service reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::NotFound { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::NotFound { .. } => "NotFound",
            UpstreamError::Rpc { .. } => "Rpc",
            UpstreamError::Transport { .. } => "Transport",
            UpstreamError::Auth { .. } => "Auth",
            UpstreamError::Disabled => "Disabled",
        }
    }
}

// `kind` gives the variant name, used as a metric label; the detail only goes to the logs.

impl ReplicatorError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicatorError::Config(e) => e.kind(),
            ReplicatorError::Broker(e) => e.kind(),
            ReplicatorError::Envelope(e) => e.kind(),
            ReplicatorError::Transform(e) => e.kind(),
            ReplicatorError::Upstream(e) => e.kind(),
            ReplicatorError::Retry(e) => e.kind(),
            ReplicatorError::Engine(e) => e.kind(),
            ReplicatorError::Supervisor(e) => e.kind(),
        }
    }
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::Invalid { .. } => "Invalid",
            ConfigError::MissingField { .. } => "MissingField",
            ConfigError::ValidationFailed { .. } => "ValidationFailed",
            ConfigError::LoadFailed { .. } => "LoadFailed",
        }
    }
}

impl BrokerError {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::ConsumerCreation { .. } => "ConsumerCreation",
            BrokerError::Subscription { .. } => "Subscription",
            BrokerError::OffsetCommit { .. } => "OffsetCommit",
            BrokerError::Closed => "Closed",
        }
    }
}

impl EnvelopeError {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeError::MissingHeaders { .. } => "MissingHeaders",
            EnvelopeError::UnsupportedVersion { .. } => "UnsupportedVersion",
            EnvelopeError::InvalidEnvelope { .. } => "InvalidEnvelope",
            EnvelopeError::MissingPayload => "MissingPayload",
        }
    }
}

impl TransformError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::InvalidMessage { .. } => "InvalidMessage",
            TransformError::InvalidPayload { .. } => "InvalidPayload",
            TransformError::InvalidGroups { .. } => "InvalidGroups",
            TransformError::MissingMembership { .. } => "MissingMembership",
            TransformError::MissingKey => "MissingKey",
            TransformError::InvalidKey { .. } => "InvalidKey",
            TransformError::MissingResourceId => "MissingResourceId",
        }
    }
}

impl RetryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RetryError::MaxRetriesExceeded { .. } => "MaxRetriesExceeded",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Subscribe(_) => "Subscribe",
            EngineError::Shutdown(_) => "Shutdown",
            EngineError::BrokerFatal { .. } => "BrokerFatal",
        }
    }
}

impl SupervisorError {
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::RestartsExhausted { .. } => "RestartsExhausted",
            SupervisorError::ConsumerCreation(_) => "ConsumerCreation",
            SupervisorError::Engine(e) => e.kind(),
        }
    }
}
