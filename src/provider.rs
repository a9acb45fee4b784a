//! Service identity types
//!
//! These types describe *what* is being asked for: the runtime type of a
//! service, the key it was registered under, and the per-call policy for what
//! to do when nothing matches.

use crate::{DiError, Result};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Bound for anything stored as an [`Instance`].
///
/// Instances are shared across threads and may outlive the call that created
/// them, so a service must be `Send + Sync + 'static`. Every such type
/// qualifies through the blanket impl.
pub trait Injectable: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Injectable for T {}

/// A type-erased service instance.
///
/// An instance produced for service type `S` always downcasts to `S`.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Downcast an erased instance to the concrete service type.
#[inline]
pub fn downcast_instance<T: Injectable>(instance: Instance, service: &ServiceType) -> Result<Arc<T>> {
    instance
        .downcast::<T>()
        .map_err(|_| DiError::type_mismatch::<T>(service.name()))
}

// =============================================================================
// ServiceType
// =============================================================================

#[derive(Debug)]
struct GenericInfo {
    definition: TypeId,
    definition_name: &'static str,
    arity: usize,
    arguments: Vec<ServiceType>,
}

/// Runtime description of a service type.
///
/// Equality and hashing use the `TypeId` only, so a closed generic built through
/// [`ServiceType::closed`] is the same service as `ServiceType::of` of that type.
#[derive(Clone)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
    generic: Option<Arc<GenericInfo>>,
}

impl ServiceType {
    /// Describe a plain type
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            generic: None,
        }
    }

    /// Describe a closed generic type together with its definition and arguments.
    pub fn closed<T: ClosedGeneric>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            generic: Some(Arc::new(GenericInfo {
                definition: TypeId::of::<T::Definition>(),
                definition_name: std::any::type_name::<T::Definition>(),
                arity: T::ARITY,
                arguments: T::type_arguments(),
            })),
        }
    }

    /// Describe an open generic definition, identified by the marker type `D`.
    pub fn open<D: 'static>(arity: usize) -> Self {
        Self {
            id: TypeId::of::<D>(),
            name: std::any::type_name::<D>(),
            generic: Some(Arc::new(GenericInfo {
                definition: TypeId::of::<D>(),
                definition_name: std::any::type_name::<D>(),
                arity,
                arguments: Vec::new(),
            })),
        }
    }

    /// Underlying `TypeId`
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this describes an open generic definition
    #[inline]
    pub fn is_open_generic(&self) -> bool {
        self.generic.as_ref().is_some_and(|g| g.definition == self.id)
    }

    /// Whether this describes a closed generic type
    #[inline]
    pub fn is_closed_generic(&self) -> bool {
        self.generic.as_ref().is_some_and(|g| g.definition != self.id)
    }

    /// The open definition of a closed generic type
    pub fn generic_definition(&self) -> Option<ServiceType> {
        let info = self.generic.as_ref()?;
        if info.definition == self.id {
            return None;
        }
        Some(Self {
            id: info.definition,
            name: info.definition_name,
            generic: Some(Arc::new(GenericInfo {
                definition: info.definition,
                definition_name: info.definition_name,
                arity: info.arity,
                arguments: Vec::new(),
            })),
        })
    }

    /// `TypeId` of the open definition of a closed generic type
    #[inline]
    pub(crate) fn closed_definition_id(&self) -> Option<TypeId> {
        self.generic
            .as_ref()
            .filter(|g| g.definition != self.id)
            .map(|g| g.definition)
    }

    /// Type arguments of a closed generic type (empty otherwise)
    #[inline]
    pub fn type_arguments(&self) -> &[ServiceType] {
        self.generic.as_ref().map_or(&[], |g| g.arguments.as_slice())
    }

    /// Number of type parameters of a generic type or definition
    #[inline]
    pub fn arity(&self) -> usize {
        self.generic.as_ref().map_or(0, |g| g.arity)
    }
}

impl PartialEq for ServiceType {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Describes a concrete instantiation of a generic Rust type so it can be
/// matched against open-generic registrations.
///
/// # Examples
///
/// ```rust
/// use scoped_injector::{ClosedGeneric, ServiceType};
///
/// struct Repository<T>(std::marker::PhantomData<T>);
///
/// /// Marker naming the open `Repository<_>` definition
/// struct RepositoryDef;
///
/// impl<T: Send + Sync + 'static> ClosedGeneric for Repository<T> {
///     type Definition = RepositoryDef;
///     const ARITY: usize = 1;
///
///     fn type_arguments() -> Vec<ServiceType> {
///         vec![ServiceType::of::<T>()]
///     }
/// }
///
/// let closed = ServiceType::closed::<Repository<u32>>();
/// assert_eq!(closed.generic_definition(), Some(ServiceType::open::<RepositoryDef>(1)));
/// ```
pub trait ClosedGeneric: Injectable {
    /// Marker type identifying the open definition
    type Definition: 'static;

    /// Number of type parameters of the definition
    const ARITY: usize;

    /// The concrete type arguments
    fn type_arguments() -> Vec<ServiceType>;
}

// =============================================================================
// ServiceKey
// =============================================================================

/// Key distinguishing several registrations of the same service type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ServiceKey {
    /// The default (unkeyed) registration
    #[default]
    Default,
    /// An additional default appended next to an existing one
    Indexed(u32),
    /// A user supplied name
    Named(Arc<str>),
    /// A user supplied number
    Id(u64),
}

impl ServiceKey {
    /// Build a named key
    #[inline]
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::Named(name.into())
    }

    /// Whether the key stands for an unkeyed registration
    #[inline]
    pub fn is_default_like(&self) -> bool {
        matches!(self, Self::Default | Self::Indexed(_))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Indexed(i) => write!(f, "default#{i}"),
            Self::Named(name) => write!(f, "{name:?}"),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for ServiceKey {
    fn from(value: &str) -> Self {
        Self::Named(value.into())
    }
}

impl From<String> for ServiceKey {
    fn from(value: String) -> Self {
        Self::Named(value.into())
    }
}

impl From<u64> for ServiceKey {
    fn from(value: u64) -> Self {
        Self::Id(value)
    }
}

/// Format an optional key for error messages (" with key ..." or nothing)
pub(crate) fn describe_key(key: Option<&ServiceKey>) -> String {
    match key {
        None | Some(ServiceKey::Default) => String::new(),
        Some(key) => format!(" with key {key}"),
    }
}

// =============================================================================
// IfUnresolved / ServiceInfo
// =============================================================================

/// What to do when a request matches no factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfUnresolved {
    /// Raise the unresolved-service error
    #[default]
    Throw,
    /// Return nothing for any unresolved outcome
    ReturnDefault,
    /// Return nothing only when the service is not registered at all;
    /// ambiguity and failed conditions still raise
    ReturnDefaultIfNotRegistered,
}

/// Everything a caller (or a dependent factory) says about a requested service.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    service_type: ServiceType,
    key: Option<ServiceKey>,
    required_type: Option<ServiceType>,
    if_unresolved: IfUnresolved,
}

impl ServiceInfo {
    /// Request a service by its runtime type
    #[inline]
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            key: None,
            required_type: None,
            if_unresolved: IfUnresolved::Throw,
        }
    }

    /// Request a plain Rust type
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::new(ServiceType::of::<T>())
    }

    /// Request a closed generic Rust type
    #[inline]
    pub fn of_closed<T: ClosedGeneric>() -> Self {
        Self::new(ServiceType::closed::<T>())
    }

    /// Ask for a specific key
    #[inline]
    pub fn keyed(mut self, key: impl Into<ServiceKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set an optional key
    #[inline]
    pub fn with_key(mut self, key: Option<ServiceKey>) -> Self {
        self.key = key;
        self
    }

    /// Ask for a specific implementation (or lookup) type
    #[inline]
    pub fn required(mut self, required: ServiceType) -> Self {
        self.required_type = Some(required);
        self
    }

    /// Set the unresolved policy
    #[inline]
    pub fn if_unresolved(mut self, policy: IfUnresolved) -> Self {
        self.if_unresolved = policy;
        self
    }

    /// Shorthand for `if_unresolved(IfUnresolved::ReturnDefault)`
    #[inline]
    pub fn optional(self) -> Self {
        self.if_unresolved(IfUnresolved::ReturnDefault)
    }

    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    #[inline]
    pub fn key(&self) -> Option<&ServiceKey> {
        self.key.as_ref()
    }

    #[inline]
    pub fn required_type(&self) -> Option<&ServiceType> {
        self.required_type.as_ref()
    }

    #[inline]
    pub fn unresolved_policy(&self) -> IfUnresolved {
        self.if_unresolved
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.service_type, describe_key(self.key.as_ref()))?;
        if let Some(required) = &self.required_type {
            write!(f, " (required {required})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::marker::PhantomData;

    struct Repo<T>(PhantomData<T>);
    struct RepoDef;

    impl<T: Injectable> ClosedGeneric for Repo<T> {
        type Definition = RepoDef;
        const ARITY: usize = 1;

        fn type_arguments() -> Vec<ServiceType> {
            vec![ServiceType::of::<T>()]
        }
    }

    #[test]
    fn test_service_type_equality_uses_type_id() {
        assert_eq!(ServiceType::of::<Repo<u8>>(), ServiceType::closed::<Repo<u8>>());
        assert_ne!(ServiceType::of::<Repo<u8>>(), ServiceType::of::<Repo<u16>>());
    }

    #[test]
    fn test_closed_generic_definition() {
        let closed = ServiceType::closed::<Repo<String>>();
        assert!(closed.is_closed_generic());
        assert!(!closed.is_open_generic());
        assert_eq!(closed.type_arguments(), &[ServiceType::of::<String>()]);

        let open = closed.generic_definition().unwrap();
        assert!(open.is_open_generic());
        assert_eq!(open, ServiceType::open::<RepoDef>(1));
        assert_eq!(open.arity(), 1);
    }

    #[test]
    fn test_plain_type_has_no_generic_info() {
        let plain = ServiceType::of::<u32>();
        assert!(!plain.is_open_generic());
        assert!(plain.generic_definition().is_none());
        assert!(plain.type_arguments().is_empty());
    }

    #[test]
    fn test_keys() {
        assert!(ServiceKey::Default.is_default_like());
        assert!(ServiceKey::Indexed(2).is_default_like());
        assert!(!ServiceKey::from("primary").is_default_like());
        assert_eq!(ServiceKey::from(7u64), ServiceKey::Id(7));
        assert_eq!(describe_key(Some(&ServiceKey::named("a"))), " with key \"a\"");
        assert_eq!(describe_key(None), "");
    }

    #[test]
    fn test_downcast_instance() {
        let instance: Instance = Arc::new(5u32);
        let service = ServiceType::of::<u32>();
        assert_eq!(*downcast_instance::<u32>(instance.clone(), &service).unwrap(), 5);

        let err = downcast_instance::<String>(instance, &service).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::TypeMismatch);
    }
}
