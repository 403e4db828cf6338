//! Error types for the reconciliation core.
//!
//! Every fatal error carries the resource it concerns (the stored id, or the id
//! that was about to be created) together with the underlying API text, so a
//! failure can be correlated with the portal and the activity log.

use thiserror::Error;

use crate::context::Interrupted;

/// A failure reported by the remote Resource Manager API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other non-success HTTP response.
    #[error("unexpected status {status} ({code}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// ARM error code, e.g. `Conflict` or `QuotaExceeded`.
        code: String,
        /// Human readable message returned by the service.
        message: String,
    },

    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The client does not implement the requested call.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ApiError {
    /// Build a [`ApiError::Status`] error.
    pub fn status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the remote object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Status { status: 404, .. })
    }

    /// Whether retrying the same request later may succeed.
    ///
    /// Request timeouts, throttling, server errors and transport failures are
    /// transient; everything else is definitive.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => matches!(*status, 408 | 429) || *status >= 500,
            Self::NotFound(_) | Self::Unsupported(_) => false,
        }
    }
}

/// A resource id string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The input was empty.
    #[error("resource ID is empty")]
    Empty,

    /// The path does not begin with `/subscriptions/{id}`.
    #[error("resource ID {input:?} does not start with a subscriptions segment")]
    MissingSubscription {
        /// The rejected input.
        input: String,
    },

    /// A type was not followed by a name.
    #[error("the number of path segments is not divisible by 2 in {input:?}")]
    OddSegments {
        /// The rejected input.
        input: String,
    },

    /// A key or value in the path was empty.
    #[error("resource ID {input:?} has an empty value for {key:?}")]
    EmptySegment {
        /// The rejected input.
        input: String,
        /// The key whose value (or which itself) was empty.
        key: String,
    },

    /// The same resource type appears twice.
    #[error("resource ID {input:?} names {resource_type:?} more than once")]
    DuplicateSegment {
        /// The rejected input.
        input: String,
        /// The repeated type.
        resource_type: String,
    },

    /// Nothing is named below the subscription.
    #[error("resource ID {input:?} names nothing below its subscription")]
    NoSegments {
        /// The rejected input.
        input: String,
    },

    /// The id is well formed but has the wrong shape for the resource type.
    #[error("resource ID {input:?} does not match the expected shape {expected}")]
    UnexpectedSegments {
        /// The rejected input.
        input: String,
        /// The expected type sequence, slash separated.
        expected: String,
    },
}

/// Waiting for an asynchronous operation did not end in success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// The caller's context was cancelled. The remote operation keeps running.
    #[error("waiting was cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation finished.
    #[error("timed out waiting for the operation to complete")]
    TimedOut,

    /// The server reported a definitive failure.
    #[error("operation failed: {reason}")]
    Failed {
        /// Failure reason reported by the server.
        reason: String,
    },

    /// The operation's target disappeared.
    #[error("the operation target no longer exists")]
    NotFound,

    /// A refreshed state was neither pending nor a target.
    #[error("unexpected state {state:?}, wanted one of {expected:?}")]
    UnexpectedState {
        /// The state that was observed.
        state: String,
        /// The states that would have ended the wait.
        expected: Vec<String>,
    },

    /// A polling request failed with a non-transient error.
    #[error("polling failed: {0}")]
    Api(#[from] ApiError),
}

impl From<Interrupted> for PollError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::TimedOut,
        }
    }
}

/// Translating between a typed model and an API payload failed.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required part of the response was absent.
    #[error("response is missing {0}")]
    Missing(String),

    /// A value could not be represented.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Attribute path of the offending value.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// The engine configuration is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The configuration document could not be decoded.
    #[error("configuration could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A Create reconciliation failed.
#[derive(Debug, Error)]
#[error("creating {target}: {kind}")]
pub struct CreateError {
    /// The id that was being created.
    pub target: String,
    /// What went wrong.
    #[source]
    pub kind: CreateErrorKind,
}

/// The cause of a [`CreateError`].
#[derive(Debug, Error)]
pub enum CreateErrorKind {
    /// The natural key already exists remotely and must be imported instead.
    #[error("a resource with the ID {existing_id:?} already exists - to be managed it needs to be imported into the state")]
    AlreadyExists {
        /// Id of the object found remotely.
        existing_id: String,
    },

    /// The managed resource already has an id.
    #[error("resource is already managed as {0}")]
    AlreadyManaged(String),

    /// The context ended before a call to the API was made or answered.
    #[error("{0}")]
    Interrupted(#[source] Interrupted),

    /// The existence check itself failed.
    #[error("checking for an existing resource: {0}")]
    ExistenceCheck(#[source] ApiError),

    /// The desired state could not be expanded into a payload.
    #[error("expanding desired state: {0}")]
    Expand(#[source] CodecError),

    /// The create call was rejected.
    #[error("{0}")]
    Api(#[source] ApiError),

    /// Waiting for the create operation failed.
    #[error("waiting for creation: {0}")]
    Poll(#[source] PollError),

    /// The resource could not be read back after creation.
    #[error("reading back after creation: {0}")]
    PostCreateReadFailed(#[source] ApiError),

    /// The id returned by the API could not be parsed.
    #[error("parsing returned ID: {0}")]
    InvalidId(#[source] ParseError),

    /// The read-back response could not be flattened.
    #[error("flattening response: {0}")]
    Flatten(#[source] CodecError),
}

/// A Read reconciliation failed. The stored id is left untouched.
#[derive(Debug, Error)]
#[error("retrieving {target}: {kind}")]
pub struct ReadError {
    /// The id being read.
    pub target: String,
    /// What went wrong.
    #[source]
    pub kind: ReadErrorKind,
}

/// The cause of a [`ReadError`].
#[derive(Debug, Error)]
pub enum ReadErrorKind {
    /// The resource has no id yet.
    #[error("resource has not been created")]
    NotCreated,

    /// An imported id does not exist remotely.
    #[error("cannot import a non-existent remote object")]
    Missing,

    /// The context ended before the read was made or answered.
    #[error("{0}")]
    Interrupted(#[source] Interrupted),

    /// The get call failed.
    #[error("{0}")]
    Api(#[source] ApiError),

    /// The id could not be parsed.
    #[error("parsing ID: {0}")]
    InvalidId(#[source] ParseError),

    /// The response could not be flattened.
    #[error("flattening response: {0}")]
    Flatten(#[source] CodecError),
}

/// An Update reconciliation failed. The stored id is left untouched.
#[derive(Debug, Error)]
#[error("updating {target}: {kind}")]
pub struct UpdateError {
    /// The id being updated.
    pub target: String,
    /// What went wrong.
    #[source]
    pub kind: UpdateErrorKind,
}

/// The cause of an [`UpdateError`].
#[derive(Debug, Error)]
pub enum UpdateErrorKind {
    /// Update was requested for a resource that does not exist.
    #[error("resource has not been created")]
    NotCreated,

    /// Another mutation is still running and forceful override was not requested.
    #[error("a pending {operation} operation is still in progress; opt in to cancelling it to force the update")]
    ConflictingOperation {
        /// Name of the operation in flight.
        operation: String,
    },

    /// The context ended before a call to the API was made or answered.
    #[error("{0}")]
    Interrupted(#[source] Interrupted),

    /// Cancelling the in-flight operation was rejected.
    #[error("cancelling the in-flight operation: {0}")]
    CancelFailed(#[source] ApiError),

    /// The resource did not settle after the in-flight operation was cancelled.
    #[error("waiting for the resource to become steady: {0}")]
    Quiescence(#[source] PollError),

    /// The desired state could not be expanded into a payload.
    #[error("expanding desired state: {0}")]
    Expand(#[source] CodecError),

    /// A call to the API failed.
    #[error("{0}")]
    Api(#[source] ApiError),

    /// Waiting for the update operation failed.
    #[error("waiting for update: {0}")]
    Poll(#[source] PollError),

    /// The resource could not be read back after the update.
    #[error("reading back after update: {0}")]
    PostUpdateReadFailed(#[source] ApiError),

    /// The read-back response could not be flattened.
    #[error("flattening response: {0}")]
    Flatten(#[source] CodecError),
}

/// A Delete reconciliation failed. The stored id is kept so the delete can be retried.
#[derive(Debug, Error)]
#[error("deleting {target}: {kind}")]
pub struct DeleteError {
    /// The id being deleted.
    pub target: String,
    /// What went wrong.
    #[source]
    pub kind: DeleteErrorKind,
}

/// The cause of a [`DeleteError`].
#[derive(Debug, Error)]
pub enum DeleteErrorKind {
    /// The context ended before the delete was made or answered.
    #[error("{0}")]
    Interrupted(#[source] Interrupted),

    /// The delete call was rejected.
    #[error("{0}")]
    Api(#[source] ApiError),

    /// Waiting for the delete operation failed.
    #[error("waiting for deletion: {0}")]
    Poll(#[source] PollError),
}

/// Host-facing error covering every reconciliation entry point.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Create failed.
    #[error(transparent)]
    Create(#[from] CreateError),

    /// Create made the remote object but failed afterwards. `state` records
    /// the object so the host can keep tracking it.
    #[error("{source}")]
    Incomplete {
        /// State document of the object that was created.
        state: Box<serde_json::Value>,
        /// Why the create did not finish.
        #[source]
        source: CreateError,
    },

    /// Read failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Update failed.
    #[error(transparent)]
    Update(#[from] UpdateError),

    /// Delete failed.
    #[error(transparent)]
    Delete(#[from] DeleteError),

    /// An id supplied by the host could not be parsed.
    #[error("parsing resource ID: {0}")]
    Parse(#[from] ParseError),

    /// A model could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Host state could not be decoded.
    #[error("decoding state: {0}")]
    State(#[from] serde_json::Error),

    /// Host state was structurally wrong.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No handler is registered for the resource type.
    #[error("unknown resource type: {0}")]
    UnknownResource(String),

    /// The engine configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ReconcileError {
    /// State the host should record even though the call failed.
    pub fn partial_state(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Incomplete { state, .. } => Some(state.as_ref()),
            _ => None,
        }
    }

    /// The status code the host should report for this error.
    pub fn code(&self) -> tonic::Code {
        use tonic::Code;

        match self {
            Self::Create(err) | Self::Incomplete { source: err, .. } => create_code(err),
            Self::Read(err) => match &err.kind {
                ReadErrorKind::NotCreated => Code::FailedPrecondition,
                ReadErrorKind::Missing => Code::NotFound,
                ReadErrorKind::Interrupted(interrupted) => interrupted_code(*interrupted),
                ReadErrorKind::Api(api) => api_code(api),
                ReadErrorKind::InvalidId(_) | ReadErrorKind::Flatten(_) => Code::InvalidArgument,
            },
            Self::Update(err) => match &err.kind {
                UpdateErrorKind::NotCreated | UpdateErrorKind::ConflictingOperation { .. } => {
                    Code::FailedPrecondition
                }
                UpdateErrorKind::Interrupted(interrupted) => interrupted_code(*interrupted),
                UpdateErrorKind::CancelFailed(api)
                | UpdateErrorKind::Api(api)
                | UpdateErrorKind::PostUpdateReadFailed(api) => api_code(api),
                UpdateErrorKind::Quiescence(poll) | UpdateErrorKind::Poll(poll) => poll_code(poll),
                UpdateErrorKind::Expand(_) | UpdateErrorKind::Flatten(_) => Code::InvalidArgument,
            },
            Self::Delete(err) => match &err.kind {
                DeleteErrorKind::Interrupted(interrupted) => interrupted_code(*interrupted),
                DeleteErrorKind::Api(api) => api_code(api),
                DeleteErrorKind::Poll(poll) => poll_code(poll),
            },
            Self::Parse(_) | Self::Codec(_) | Self::State(_) | Self::InvalidState(_) => {
                Code::InvalidArgument
            }
            Self::UnknownResource(_) => Code::NotFound,
            Self::Config(_) => Code::FailedPrecondition,
        }
    }
}

fn api_code(err: &ApiError) -> tonic::Code {
    use tonic::Code;

    match err {
        ApiError::NotFound(_) => Code::NotFound,
        ApiError::Transport(_) => Code::Unavailable,
        ApiError::Unsupported(_) => Code::Unimplemented,
        ApiError::Status { status, .. } => match *status {
            400 | 422 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            408 => Code::DeadlineExceeded,
            409 => Code::Aborted,
            412 => Code::FailedPrecondition,
            429 => Code::ResourceExhausted,
            501 => Code::Unimplemented,
            s if s >= 500 => Code::Unavailable,
            _ => Code::Unknown,
        },
    }
}

fn create_code(err: &CreateError) -> tonic::Code {
    use tonic::Code;

    match &err.kind {
        CreateErrorKind::AlreadyExists { .. } => Code::AlreadyExists,
        CreateErrorKind::AlreadyManaged(_) => Code::FailedPrecondition,
        CreateErrorKind::Interrupted(interrupted) => interrupted_code(*interrupted),
        CreateErrorKind::ExistenceCheck(api)
        | CreateErrorKind::Api(api)
        | CreateErrorKind::PostCreateReadFailed(api) => api_code(api),
        CreateErrorKind::Poll(poll) => poll_code(poll),
        CreateErrorKind::InvalidId(_) => Code::Internal,
        CreateErrorKind::Expand(_) | CreateErrorKind::Flatten(_) => Code::InvalidArgument,
    }
}

fn interrupted_code(interrupted: Interrupted) -> tonic::Code {
    match interrupted {
        Interrupted::Cancelled => tonic::Code::Cancelled,
        Interrupted::DeadlineExceeded => tonic::Code::DeadlineExceeded,
    }
}

fn poll_code(err: &PollError) -> tonic::Code {
    use tonic::Code;

    match err {
        PollError::Cancelled => Code::Cancelled,
        PollError::TimedOut => Code::DeadlineExceeded,
        PollError::Failed { .. } | PollError::UnexpectedState { .. } => Code::Aborted,
        PollError::NotFound => Code::NotFound,
        PollError::Api(api) => api_code(api),
    }
}

impl From<ReconcileError> for tonic::Status {
    fn from(err: ReconcileError) -> Self {
        tonic::Status::new(err.code(), err.to_string())
    }
}
