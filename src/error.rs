//! Error types for dependency injection
//!
//! Every failure surfaces as a single [`DiError`] carrying a stable [`ErrorCode`].
//! Codes are grouped into an [`ErrorCategory`] so callers can react to a whole
//! class of failures (for example "anything unresolved") without matching every
//! variant.

use thiserror::Error;

/// Broad class of a [`DiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Nothing (or nothing unambiguous) could be matched for a request
    Unresolved,
    /// A registration was rejected
    Registration,
    /// The container or a scope is in the wrong state for the operation
    Lifecycle,
    /// The object graph or the concurrent creation protocol is broken
    Concurrency,
    /// A service was produced but could not be used
    Creation,
    /// A user disposer failed during teardown
    Disposal,
}

/// Stable numeric code of a [`DiError`].
///
/// Codes never change between releases; new codes are only appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum ErrorCode {
    NotRegistered = 100,
    Ambiguous = 101,
    FallbacksExhausted = 102,

    DuplicateDefault = 200,
    DuplicateKey = 201,
    NotAssignable = 202,
    GenericArgsMismatch = 203,
    RegistrationLocked = 204,

    ContainerDisposed = 300,
    ScopeDisposed = 301,
    NoCurrentScope = 302,
    NoMatchingScopeName = 303,

    RecursiveDependency = 400,
    CaptiveDependency = 401,
    WaitTimeout = 402,
    InstanceCollected = 403,

    TypeMismatch = 500,
    CreationFailed = 501,

    DisposerFailed = 600,
}

impl ErrorCode {
    /// Numeric value of the code
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Category the code belongs to
    pub fn category(self) -> ErrorCategory {
        match self.as_u16() / 100 {
            1 => ErrorCategory::Unresolved,
            2 => ErrorCategory::Registration,
            3 => ErrorCategory::Lifecycle,
            4 => ErrorCategory::Concurrency,
            5 => ErrorCategory::Creation,
            _ => ErrorCategory::Disposal,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DI{:03}", self.as_u16())
    }
}

/// Errors that can occur during dependency injection operations
#[derive(Error, Debug, Clone)]
pub enum DiError {
    // ===== Unresolved =====
    /// Nothing is registered for the requested service
    #[error("Unable to resolve {service}{key}: nothing is registered. {attempted}")]
    NotRegistered {
        service: String,
        key: String,
        attempted: String,
    },

    /// More than one factory matches and none could be preferred
    #[error("Unable to resolve {service}{key}: {count} factories match ({candidates})")]
    Ambiguous {
        service: String,
        key: String,
        count: usize,
        candidates: String,
    },

    /// Registrations exist but none matched, and every fallback was tried
    #[error("Unable to resolve {service}{key}: registrations exist but none matched and all fallback resolvers are exhausted. {attempted}")]
    FallbacksExhausted {
        service: String,
        key: String,
        attempted: String,
    },

    // ===== Registration =====
    /// A default registration already exists
    #[error("Service {service} already has a default registration (factory #{existing})")]
    DuplicateDefault { service: String, existing: u64 },

    /// The key is already taken for the service
    #[error("Service {service} is already registered with key {key}")]
    DuplicateKey { service: String, key: String },

    /// The factory produces something that cannot serve the service type
    #[error("Implementation {implementation} is not assignable to service {service}")]
    NotAssignable {
        service: String,
        implementation: String,
    },

    /// Open-generic registration used with incompatible type arguments
    #[error("Open-generic {definition} expects {expected} type argument(s) but {service} has {actual}")]
    GenericArgsMismatch {
        definition: String,
        service: String,
        expected: usize,
        actual: usize,
    },

    /// The registry no longer accepts changes
    #[error("Container is locked - cannot register or unregister {service}")]
    RegistrationLocked { service: String },

    // ===== Lifecycle =====
    /// Container was disposed
    #[error("Container is disposed")]
    ContainerDisposed,

    /// Scope was disposed
    #[error("Scope {scope} is disposed")]
    ScopeDisposed { scope: String },

    /// A scoped service was requested outside of any scope
    #[error("No current scope is open to resolve scoped service {service}")]
    NoCurrentScope { service: String },

    /// No open scope carries the requested name
    #[error("No open scope named {name} to resolve {service}")]
    NoMatchingScopeName { service: String, name: String },

    // ===== Concurrency / graph correctness =====
    /// The dependency chain loops back to itself
    #[error("Recursive dependency detected: {chain}")]
    RecursiveDependency { service: String, chain: String },

    /// A shorter lived dependency is injected into a longer lived owner
    #[error("Dependency {dependency} ({dependency_reuse}) has a shorter lifespan than its owner {owner} ({owner_reuse})")]
    CaptiveDependency {
        dependency: String,
        dependency_reuse: String,
        owner: String,
        owner_reuse: String,
    },

    /// Another thread did not finish creating a shared instance in time
    #[error("Timed out after {waited_ms}ms waiting for {service} to be created by another caller")]
    WaitTimeout { service: String, waited_ms: u64 },

    /// A previously stored instance is no longer available
    #[error("Reused instance of {service} is no longer available")]
    InstanceCollected { service: String },

    // ===== Creation =====
    /// Resolved value has a different type than requested
    #[error("Resolved instance of {service} is not of type {expected}")]
    TypeMismatch { service: String, expected: String },

    /// A factory failed to produce its instance
    #[error("Failed to create service {service}: {reason}")]
    CreationFailed { service: String, reason: String },

    // ===== Disposal =====
    /// A user disposer reported failure
    #[error("Failed to dispose {service}: {reason}")]
    DisposerFailed { service: String, reason: String },
}

impl DiError {
    /// Stable code of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotRegistered { .. } => ErrorCode::NotRegistered,
            Self::Ambiguous { .. } => ErrorCode::Ambiguous,
            Self::FallbacksExhausted { .. } => ErrorCode::FallbacksExhausted,
            Self::DuplicateDefault { .. } => ErrorCode::DuplicateDefault,
            Self::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            Self::NotAssignable { .. } => ErrorCode::NotAssignable,
            Self::GenericArgsMismatch { .. } => ErrorCode::GenericArgsMismatch,
            Self::RegistrationLocked { .. } => ErrorCode::RegistrationLocked,
            Self::ContainerDisposed => ErrorCode::ContainerDisposed,
            Self::ScopeDisposed { .. } => ErrorCode::ScopeDisposed,
            Self::NoCurrentScope { .. } => ErrorCode::NoCurrentScope,
            Self::NoMatchingScopeName { .. } => ErrorCode::NoMatchingScopeName,
            Self::RecursiveDependency { .. } => ErrorCode::RecursiveDependency,
            Self::CaptiveDependency { .. } => ErrorCode::CaptiveDependency,
            Self::WaitTimeout { .. } => ErrorCode::WaitTimeout,
            Self::InstanceCollected { .. } => ErrorCode::InstanceCollected,
            Self::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Self::CreationFailed { .. } => ErrorCode::CreationFailed,
            Self::DisposerFailed { .. } => ErrorCode::DisposerFailed,
        }
    }

    /// Category of this error
    #[inline]
    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// Whether this error belongs to the unresolved-service class
    #[inline]
    pub fn is_unresolved(&self) -> bool {
        self.category() == ErrorCategory::Unresolved
    }

    /// Whether this error is raised by the runtime itself rather than reported by
    /// a user disposer. Structural errors are never swallowed during teardown.
    #[inline]
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::DisposerFailed { .. })
    }

    // ===== Helper constructors =====

    /// Create a NotRegistered error
    pub fn not_registered(service: impl Into<String>, key: impl Into<String>, attempted: impl Into<String>) -> Self {
        Self::NotRegistered {
            service: service.into(),
            key: key.into(),
            attempted: attempted.into(),
        }
    }

    /// Create a RecursiveDependency error
    #[inline]
    pub fn recursive(service: impl Into<String>, chain: impl Into<String>) -> Self {
        Self::RecursiveDependency {
            service: service.into(),
            chain: chain.into(),
        }
    }

    /// Create a CreationFailed error for a type
    #[inline]
    pub fn creation_failed<T: ?Sized + 'static>(reason: impl Into<String>) -> Self {
        Self::CreationFailed {
            service: std::any::type_name::<T>().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a DisposerFailed error for a type
    #[inline]
    pub fn disposer_failed<T: ?Sized + 'static>(reason: impl Into<String>) -> Self {
        Self::DisposerFailed {
            service: std::any::type_name::<T>().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a TypeMismatch error for a type
    #[inline]
    pub fn type_mismatch<T: ?Sized + 'static>(service: impl Into<String>) -> Self {
        Self::TypeMismatch {
            service: service.into(),
            expected: std::any::type_name::<T>().to_string(),
        }
    }

    /// Create a ScopeDisposed error
    #[inline]
    pub fn scope_disposed(scope: impl std::fmt::Display) -> Self {
        Self::ScopeDisposed {
            scope: scope.to_string(),
        }
    }
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;
