use crate::engine::EngineError;
use crate::invariant::InvariantViolation;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Store,
    Snapshot,
    Iterator,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Store => write!(f, "store"),
            ResourceType::Snapshot => write!(f, "snapshot"),
            ResourceType::Iterator => write!(f, "iterator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvHandleErrorCode {
    Io,
    InvalidConfig,
    StoreOpenFailed,
    StoreNotFound,
    SnapshotNotFound,
    IteratorNotFound,
    StoreClosing,
    SnapshotClosing,
    IteratorClosing,
    Busy,
    TooManyIterators,
    Engine,
    InvariantViolation,
}

impl KvHandleErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            KvHandleErrorCode::Io => "io",
            KvHandleErrorCode::InvalidConfig => "invalid_config",
            KvHandleErrorCode::StoreOpenFailed => "store_open_failed",
            KvHandleErrorCode::StoreNotFound => "store_not_found",
            KvHandleErrorCode::SnapshotNotFound => "snapshot_not_found",
            KvHandleErrorCode::IteratorNotFound => "iterator_not_found",
            KvHandleErrorCode::StoreClosing => "store_closing",
            KvHandleErrorCode::SnapshotClosing => "snapshot_closing",
            KvHandleErrorCode::IteratorClosing => "iterator_closing",
            KvHandleErrorCode::Busy => "busy",
            KvHandleErrorCode::TooManyIterators => "too_many_iterators",
            KvHandleErrorCode::Engine => "engine",
            KvHandleErrorCode::InvariantViolation => "invariant_violation",
        }
    }
}

#[derive(Debug, Error)]
pub enum KvHandleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("failed to open store at '{path}': {source}")]
    StoreOpen {
        path: String,
        #[source]
        source: EngineError,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: u64,
    },
    #[error("{resource_type} '{resource_id}' is closing")]
    Closing {
        resource_type: ResourceType,
        resource_id: u64,
    },
    #[error("{resource_type} '{resource_id}' is busy on another thread")]
    Busy {
        resource_type: ResourceType,
        resource_id: u64,
    },
    #[error("too many open iterators (limit {limit})")]
    TooManyIterators { limit: usize },
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolation),
}

impl KvHandleError {
    pub fn not_found(resource_type: ResourceType, resource_id: u64) -> Self {
        KvHandleError::NotFound {
            resource_type,
            resource_id,
        }
    }

    pub fn code(&self) -> KvHandleErrorCode {
        match self {
            KvHandleError::Io(_) => KvHandleErrorCode::Io,
            KvHandleError::InvalidConfig { .. } => KvHandleErrorCode::InvalidConfig,
            KvHandleError::StoreOpen { .. } => KvHandleErrorCode::StoreOpenFailed,
            KvHandleError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Store => KvHandleErrorCode::StoreNotFound,
                ResourceType::Snapshot => KvHandleErrorCode::SnapshotNotFound,
                ResourceType::Iterator => KvHandleErrorCode::IteratorNotFound,
            },
            KvHandleError::Closing { resource_type, .. } => match resource_type {
                ResourceType::Store => KvHandleErrorCode::StoreClosing,
                ResourceType::Snapshot => KvHandleErrorCode::SnapshotClosing,
                ResourceType::Iterator => KvHandleErrorCode::IteratorClosing,
            },
            KvHandleError::Busy { .. } => KvHandleErrorCode::Busy,
            KvHandleError::TooManyIterators { .. } => KvHandleErrorCode::TooManyIterators,
            KvHandleError::Engine(_) => KvHandleErrorCode::Engine,
            KvHandleError::InvariantViolation(_) => KvHandleErrorCode::InvariantViolation,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KvHandleError::NotFound { .. })
    }
}
