//! Factories: registered ways to build one service
//!
//! The runtime only depends on the [`Factory`] capability: given a
//! [`Request`], produce a construction [`Plan`] (or nothing). A [`Registration`]
//! wraps a factory with everything the runtime needs to know about it: a globally
//! unique [`FactoryId`], its [`Reuse`], its [`Setup`] and the service types it can
//! be converted to.
//!
//! Built-in factories:
//!
//! - [`InstanceFactory`] - a pre-built instance
//! - [`DelegateFactory`] - a closure, optionally with declared dependencies
//! - [`DecoratorFactory`] - wraps the service it decorates
//! - [`OpenGenericFactory`] - closes over concrete type arguments on demand
//! - [`FnFactory`] - a raw plan producer, used for wrappers and extensions

use crate::{
    ClosedGeneric, Container, DiError, Disposal, Disposer, Injectable, Instance, InvokeArgs, Plan, Request, Result, Reuse,
    ServiceInfo, ServiceKey, ServiceType,
};
use ahash::RandomState;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// A factory that produces construction plans (trait for external extensibility)
pub trait Factory: Send + Sync + 'static {
    /// Build the plan for the request, or `None` when this factory declines it.
    fn create_plan(&self, request: &Request) -> Result<Option<Plan>>;

    /// Registration-time check that the factory can serve `service_type` under `key`.
    fn validate(&self, _service_type: &ServiceType, _key: &ServiceKey) -> Result<()> {
        Ok(())
    }

    /// Concrete type the factory produces, when known
    fn implementation_type(&self) -> Option<ServiceType> {
        None
    }

    /// Whether the factory is registered against an open-generic definition
    fn is_open_generic(&self) -> bool {
        false
    }

    /// Produce the concrete registration for a closed generic service type.
    fn close_generic(&self, _open: &Registration, _service_type: &ServiceType, _key: &ServiceKey) -> Result<Option<FactoryRef>> {
        Ok(None)
    }
}

// =============================================================================
// Ids, kinds, setup
// =============================================================================

/// Globally unique, monotonically increasing factory identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryId(u64);

impl FactoryId {
    #[inline]
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of a registered factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FactoryKind {
    /// Produces the service itself
    #[default]
    Service,
    /// Wraps another resolved service of the same type
    Decorator,
    /// Produces a generic wrapper around an inner service
    Wrapper,
}

/// Predicate evaluated against the request before a factory is used
pub type Condition = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Per-factory options.
#[derive(Default)]
pub struct Setup {
    condition: Option<Condition>,
    metadata: Option<Arc<dyn Any + Send + Sync>>,
    order: i32,
    disposer: Option<Disposer>,
    disposal_order: Option<i32>,
    do_not_cache: bool,
    prefer_in_single_resolve: bool,
    open_resolution_scope: bool,
    resolution_call: AtomicBool,
}

impl Setup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only use the factory when `condition` holds for the request
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Attach arbitrary metadata (visible to conditions and selectors)
    pub fn with_metadata<M: Injectable>(mut self, metadata: M) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// Decorator ordering; higher orders wrap outermost
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Dispose instances through `T`'s [`Disposable`] impl
    pub fn disposable<T: Disposable>(mut self) -> Self {
        self.disposer = Some(Arc::new(|instance: &Instance| match instance.downcast_ref::<T>() {
            Some(service) => service.dispose(),
            None => Ok(()),
        }));
        self
    }

    /// Dispose instances through an erased disposer
    pub fn with_disposer<F>(mut self, disposer: F) -> Self
    where
        F: Fn(&Instance) -> Result<()> + Send + Sync + 'static,
    {
        self.disposer = Some(Arc::new(disposer));
        self
    }

    /// Dispose ascending by `order`, before unordered disposables
    pub fn with_disposal_order(mut self, order: i32) -> Self {
        self.disposal_order = Some(order);
        self
    }

    /// Never cache plans that involve this factory
    pub fn do_not_cache(mut self) -> Self {
        self.do_not_cache = true;
        self
    }

    /// Win ties against other default registrations of the same service
    pub fn prefer_in_single_resolve(mut self) -> Self {
        self.prefer_in_single_resolve = true;
        self
    }

    /// Build the service and its dependencies inside a fresh scope
    pub fn open_resolution_scope(mut self) -> Self {
        self.open_resolution_scope = true;
        self
    }

    /// Always resolve this factory out of line, through a resolution call
    pub fn as_resolution_call(self) -> Self {
        self.resolution_call.store(true, Ordering::Relaxed);
        self
    }

    #[inline]
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Whether the condition (if any) holds for the request
    #[inline]
    pub fn matches(&self, request: &Request) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(request))
    }

    /// Typed access to the metadata
    pub fn metadata<M: Injectable>(&self) -> Option<&M> {
        self.metadata.as_ref().and_then(|m| m.downcast_ref::<M>())
    }

    #[inline]
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Disposal for produced instances, if the service is disposable
    pub fn disposal(&self) -> Option<Disposal> {
        let disposer = Arc::clone(self.disposer.as_ref()?);
        Some(match self.disposal_order {
            Some(order) => Disposal::ordered(disposer, order),
            None => Disposal::new(disposer),
        })
    }

    #[inline]
    pub fn is_disposable(&self) -> bool {
        self.disposer.is_some()
    }

    #[inline]
    pub fn is_do_not_cache(&self) -> bool {
        self.do_not_cache
    }

    #[inline]
    pub fn is_preferred_in_single_resolve(&self) -> bool {
        self.prefer_in_single_resolve
    }

    #[inline]
    pub fn opens_resolution_scope(&self) -> bool {
        self.open_resolution_scope
    }

    /// Whether the factory is resolved through a resolution call
    #[inline]
    pub fn is_resolution_call(&self) -> bool {
        self.resolution_call.load(Ordering::Acquire)
    }

    /// One-way upgrade to resolution-call mode
    #[inline]
    pub(crate) fn force_resolution_call(&self) {
        self.resolution_call.store(true, Ordering::Release);
    }
}

impl Clone for Setup {
    fn clone(&self) -> Self {
        Self {
            condition: self.condition.clone(),
            metadata: self.metadata.clone(),
            order: self.order,
            disposer: self.disposer.clone(),
            disposal_order: self.disposal_order,
            do_not_cache: self.do_not_cache,
            prefer_in_single_resolve: self.prefer_in_single_resolve,
            open_resolution_scope: self.open_resolution_scope,
            resolution_call: AtomicBool::new(self.is_resolution_call()),
        }
    }
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup")
            .field("has_condition", &self.condition.is_some())
            .field("order", &self.order)
            .field("disposable", &self.is_disposable())
            .field("disposal_order", &self.disposal_order)
            .field("do_not_cache", &self.do_not_cache)
            .field("prefer_in_single_resolve", &self.prefer_in_single_resolve)
            .field("open_resolution_scope", &self.open_resolution_scope)
            .field("resolution_call", &self.is_resolution_call())
            .finish()
    }
}

/// Services that need explicit teardown when their scope is disposed.
///
/// Return [`DiError::DisposerFailed`] for failures that should be logged and
/// skipped; any other error aborts with that error after teardown completes.
pub trait Disposable: Injectable {
    fn dispose(&self) -> Result<()>;
}

// =============================================================================
// Registration
// =============================================================================

/// Converts an instance of the implementation type into a service type
pub type Caster = Arc<dyn Fn(Instance) -> Result<Instance> + Send + Sync>;

#[derive(Clone)]
struct ServiceCast {
    service: TypeId,
    cast: Caster,
}

/// Shared handle to a registration
pub type FactoryRef = Arc<Registration>;

/// A factory together with its id, kind, reuse, setup and service casts.
pub struct Registration {
    id: FactoryId,
    kind: FactoryKind,
    factory: Arc<dyn Factory>,
    reuse: Option<Reuse>,
    setup: Setup,
    casts: Vec<ServiceCast>,
}

impl Registration {
    /// Register a factory; reuse defaults to the container's rules
    pub fn new(factory: impl Factory) -> Self {
        Self::from_arc(Arc::new(factory))
    }

    /// Register a shared factory
    pub fn from_arc(factory: Arc<dyn Factory>) -> Self {
        Self {
            id: FactoryId::next(),
            kind: FactoryKind::Service,
            factory,
            reuse: None,
            setup: Setup::default(),
            casts: Vec::new(),
        }
    }

    /// A pre-built instance, stored as a singleton
    pub fn instance<T: Injectable>(value: T) -> Self {
        Self::new(InstanceFactory::new(value)).with_reuse(Reuse::Singleton)
    }

    /// A closure without dependencies
    pub fn delegate<T, F>(create: F) -> Self
    where
        T: Injectable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(DelegateFactory::new(create))
    }

    pub fn with_reuse(mut self, reuse: Reuse) -> Self {
        self.reuse = Some(reuse);
        self
    }

    pub fn with_setup(mut self, setup: Setup) -> Self {
        self.setup = setup;
        self
    }

    /// Let the implementation `I` also serve service type `S`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::{Container, Registration, Reuse};
    /// use std::sync::Arc;
    ///
    /// trait Greeter: Send + Sync {
    ///     fn greet(&self) -> String;
    /// }
    ///
    /// struct English;
    /// impl Greeter for English {
    ///     fn greet(&self) -> String { "hello".into() }
    /// }
    ///
    /// let container = Container::new();
    /// container
    ///     .register_service::<Arc<dyn Greeter>>(
    ///         Registration::delegate(|| English)
    ///             .with_reuse(Reuse::Singleton)
    ///             .serves(|english: Arc<English>| english as Arc<dyn Greeter>),
    ///     )
    ///     .unwrap();
    ///
    /// let greeter = container.get::<Arc<dyn Greeter>>().unwrap();
    /// assert_eq!(greeter.greet(), "hello");
    /// ```
    pub fn serves<I, S, F>(mut self, convert: F) -> Self
    where
        I: Injectable,
        S: Injectable,
        F: Fn(Arc<I>) -> S + Send + Sync + 'static,
    {
        let cast: Caster = Arc::new(move |instance: Instance| {
            let implementation = instance
                .downcast::<I>()
                .map_err(|_| DiError::type_mismatch::<I>(std::any::type_name::<S>()))?;
            Ok(Arc::new(convert(implementation)) as Instance)
        });
        self.casts.push(ServiceCast {
            service: TypeId::of::<S>(),
            cast,
        });
        self
    }

    pub(crate) fn into_kind(mut self, kind: FactoryKind) -> Self {
        self.kind = kind;
        self
    }

    /// Concrete registration derived from this one (used when closing generics)
    pub fn derive(&self, factory: Arc<dyn Factory>) -> Self {
        Self {
            id: FactoryId::next(),
            kind: self.kind,
            factory,
            reuse: self.reuse.clone(),
            setup: self.setup.clone(),
            casts: self.casts.clone(),
        }
    }

    #[inline]
    pub fn id(&self) -> FactoryId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> FactoryKind {
        self.kind
    }

    #[inline]
    pub fn factory(&self) -> &Arc<dyn Factory> {
        &self.factory
    }

    /// Explicit reuse, if any (`None` means the rules' default)
    #[inline]
    pub fn reuse(&self) -> Option<&Reuse> {
        self.reuse.as_ref()
    }

    #[inline]
    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    #[inline]
    pub fn implementation_type(&self) -> Option<ServiceType> {
        self.factory.implementation_type()
    }

    /// Whether an instance produced here can be returned as `service`
    pub fn can_serve(&self, service: &ServiceType) -> bool {
        match self.implementation_type() {
            None => true,
            Some(implementation) => {
                implementation == *service || self.casts.iter().any(|c| c.service == service.id())
            }
        }
    }

    /// Cast needed to return the produced instance as `service`, if any
    pub(crate) fn cast_to(&self, service: &ServiceType) -> Option<Caster> {
        let implementation = self.implementation_type()?;
        if implementation == *service {
            return None;
        }
        self.casts
            .iter()
            .find(|c| c.service == service.id())
            .map(|c| Arc::clone(&c.cast))
    }

    /// Registration-time validation against a service type
    pub(crate) fn validate_for(&self, service: &ServiceType, key: &ServiceKey) -> Result<()> {
        let implementation_name = || {
            self.implementation_type()
                .map_or("<unknown>", |t| t.name())
                .to_string()
        };
        if service.is_open_generic() != self.factory.is_open_generic() {
            return Err(DiError::NotAssignable {
                service: service.name().to_string(),
                implementation: implementation_name(),
            });
        }
        if !service.is_open_generic() && !self.can_serve(service) {
            return Err(DiError::NotAssignable {
                service: service.name().to_string(),
                implementation: implementation_name(),
            });
        }
        self.factory.validate(service, key)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("implementation", &self.implementation_type())
            .field("reuse", &self.reuse)
            .field("setup", &self.setup)
            .finish()
    }
}

// =============================================================================
// Instance Factory
// =============================================================================

/// A pre-built instance
pub struct InstanceFactory {
    instance: Instance,
    implementation: ServiceType,
}

impl InstanceFactory {
    pub fn new<T: Injectable>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Injectable>(value: Arc<T>) -> Self {
        Self {
            instance: value as Instance,
            implementation: ServiceType::of::<T>(),
        }
    }
}

impl Factory for InstanceFactory {
    fn create_plan(&self, _request: &Request) -> Result<Option<Plan>> {
        Ok(Some(Plan::Constant(Arc::clone(&self.instance))))
    }

    fn implementation_type(&self) -> Option<ServiceType> {
        Some(self.implementation.clone())
    }
}

// =============================================================================
// Delegate Factory
// =============================================================================

/// Type-erased creation function over resolved dependencies
pub type InvokeFn = Arc<dyn Fn(&InvokeArgs<'_>) -> Result<Instance> + Send + Sync>;

/// A closure building the service from declared dependencies
pub struct DelegateFactory {
    implementation: ServiceType,
    dependencies: Vec<ServiceInfo>,
    call: InvokeFn,
}

impl DelegateFactory {
    /// A closure without dependencies
    pub fn new<T, F>(create: F) -> Self
    where
        T: Injectable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            implementation: ServiceType::of::<T>(),
            dependencies: Vec::new(),
            call: Arc::new(move |_| Ok(Arc::new(create()) as Instance)),
        }
    }

    /// A closure over declared dependencies, resolved as part of the plan.
    ///
    /// Argument `i` of the [`InvokeArgs`] holds the resolved `dependencies[i]`.
    pub fn with_dependencies<T, F>(dependencies: Vec<ServiceInfo>, create: F) -> Self
    where
        T: Injectable,
        F: Fn(&InvokeArgs<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            implementation: ServiceType::of::<T>(),
            dependencies,
            call: Arc::new(move |args| Ok(Arc::new(create(args)?) as Instance)),
        }
    }

    /// A closure resolving whatever it needs from the container at run time
    pub fn resolving<T, F>(create: F) -> Self
    where
        T: Injectable,
        F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            implementation: ServiceType::of::<T>(),
            dependencies: Vec::new(),
            call: Arc::new(move |args| Ok(Arc::new(create(args.container())?) as Instance)),
        }
    }

    /// Declared dependencies
    #[inline]
    pub fn dependencies(&self) -> &[ServiceInfo] {
        &self.dependencies
    }
}

impl Factory for DelegateFactory {
    fn create_plan(&self, request: &Request) -> Result<Option<Plan>> {
        let args = self
            .dependencies
            .iter()
            .map(|dependency| request.dependency(dependency.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Plan::invoke(self.implementation.clone(), args, Arc::clone(&self.call))))
    }

    fn implementation_type(&self) -> Option<ServiceType> {
        Some(self.implementation.clone())
    }
}

// =============================================================================
// Decorator Factory
// =============================================================================

type DecorateFn = Arc<dyn Fn(Instance) -> Result<Instance> + Send + Sync>;

/// Wraps the instance of the service being decorated.
///
/// The decorated service is requested as a dependency with the same type, key
/// and required type as the decorator's own request.
pub struct DecoratorFactory {
    implementation: Option<ServiceType>,
    decorate: DecorateFn,
}

impl DecoratorFactory {
    /// Decorate a `T` with a new `T`
    pub fn new<T, F>(decorate: F) -> Self
    where
        T: Injectable,
        F: Fn(Arc<T>) -> T + Send + Sync + 'static,
    {
        Self {
            implementation: Some(ServiceType::of::<T>()),
            decorate: Arc::new(move |instance: Instance| {
                let inner = instance
                    .downcast::<T>()
                    .map_err(|_| DiError::type_mismatch::<T>(std::any::type_name::<T>()))?;
                Ok(Arc::new(decorate(inner)) as Instance)
            }),
        }
    }

    /// Decorate any service type through erased instances
    pub fn erased<F>(decorate: F) -> Self
    where
        F: Fn(Instance) -> Result<Instance> + Send + Sync + 'static,
    {
        Self {
            implementation: None,
            decorate: Arc::new(decorate),
        }
    }
}

impl Factory for DecoratorFactory {
    fn create_plan(&self, request: &Request) -> Result<Option<Plan>> {
        let mut decorated = ServiceInfo::new(request.service_type().clone())
            .with_key(request.key().cloned())
            .if_unresolved(request.if_unresolved());
        if let Some(required) = request.required_type() {
            decorated = decorated.required(required.clone());
        }
        let inner = request.dependency(decorated)?;
        if inner.is_missing() {
            return Ok(Some(Plan::Missing));
        }
        let decorate = Arc::clone(&self.decorate);
        let call: InvokeFn = Arc::new(move |args| decorate(args.instance(0)?));
        Ok(Some(Plan::invoke(request.service_type().clone(), vec![inner], call)))
    }

    fn implementation_type(&self) -> Option<ServiceType> {
        self.implementation.clone()
    }
}

// =============================================================================
// Fn Factory
// =============================================================================

type PlanFn = Arc<dyn Fn(&Request) -> Result<Option<Plan>> + Send + Sync>;

/// Produces plans through a closure; the building block for wrappers
pub struct FnFactory {
    implementation: Option<ServiceType>,
    plan: PlanFn,
}

impl FnFactory {
    pub fn new<F>(plan: F) -> Self
    where
        F: Fn(&Request) -> Result<Option<Plan>> + Send + Sync + 'static,
    {
        Self {
            implementation: None,
            plan: Arc::new(plan),
        }
    }

    /// Declare the implementation type produced by the plans
    pub fn producing(mut self, implementation: ServiceType) -> Self {
        self.implementation = Some(implementation);
        self
    }
}

impl Factory for FnFactory {
    fn create_plan(&self, request: &Request) -> Result<Option<Plan>> {
        (self.plan)(request)
    }

    fn implementation_type(&self) -> Option<ServiceType> {
        self.implementation.clone()
    }
}

// =============================================================================
// Open Generic Factory
// =============================================================================

struct ClosedVariant {
    implementation: ServiceType,
    factory: Arc<dyn Factory>,
}

/// A registration for an open generic definition.
///
/// Rust cannot instantiate generics at run time, so every supported set of type
/// arguments is listed up front; the table is consulted when a closed type is
/// requested and the generated registration is memoised per
/// (implementation type, key).
///
/// # Examples
///
/// ```rust
/// use scoped_injector::{ClosedGeneric, Container, DelegateFactory, OpenGenericFactory, Registration, ServiceType};
/// use std::marker::PhantomData;
///
/// struct Repo<T>(PhantomData<T>);
/// struct RepoDef;
///
/// impl<T: Send + Sync + 'static> ClosedGeneric for Repo<T> {
///     type Definition = RepoDef;
///     const ARITY: usize = 1;
///     fn type_arguments() -> Vec<ServiceType> {
///         vec![ServiceType::of::<T>()]
///     }
/// }
///
/// let open = OpenGenericFactory::new(ServiceType::open::<RepoDef>(1))
///     .close_with::<Repo<u32>>(DelegateFactory::new(|| Repo::<u32>(PhantomData)));
///
/// let container = Container::new();
/// container
///     .register(Registration::new(open), ServiceType::open::<RepoDef>(1), None, None)
///     .unwrap();
/// assert!(container.get_generic::<Repo<u32>>().is_ok());
/// ```
pub struct OpenGenericFactory {
    definition: ServiceType,
    variants: HashMap<Vec<TypeId>, ClosedVariant, RandomState>,
    closed: DashMap<(TypeId, ServiceKey), FactoryRef, RandomState>,
}

impl OpenGenericFactory {
    /// Start a table for the open definition
    pub fn new(definition: ServiceType) -> Self {
        Self {
            definition,
            variants: HashMap::with_hasher(RandomState::new()),
            closed: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Add the factory used for the closed type `T`
    pub fn close_with<T: ClosedGeneric>(mut self, factory: impl Factory) -> Self {
        let arguments = T::type_arguments().iter().map(ServiceType::id).collect();
        self.variants.insert(
            arguments,
            ClosedVariant {
                implementation: ServiceType::closed::<T>(),
                factory: Arc::new(factory),
            },
        );
        self
    }

    /// The open definition
    #[inline]
    pub fn definition(&self) -> &ServiceType {
        &self.definition
    }
}

impl Factory for OpenGenericFactory {
    fn create_plan(&self, _request: &Request) -> Result<Option<Plan>> {
        // Only closed registrations produce plans
        Ok(None)
    }

    fn validate(&self, service_type: &ServiceType, _key: &ServiceKey) -> Result<()> {
        if service_type.id() != self.definition.id() {
            return Err(DiError::NotAssignable {
                service: service_type.name().to_string(),
                implementation: self.definition.name().to_string(),
            });
        }
        if service_type.arity() != self.definition.arity() {
            return Err(DiError::GenericArgsMismatch {
                definition: self.definition.name().to_string(),
                service: service_type.name().to_string(),
                expected: self.definition.arity(),
                actual: service_type.arity(),
            });
        }
        Ok(())
    }

    fn is_open_generic(&self) -> bool {
        true
    }

    fn close_generic(&self, open: &Registration, service_type: &ServiceType, key: &ServiceKey) -> Result<Option<FactoryRef>> {
        let arguments = service_type.type_arguments();
        if arguments.len() != self.definition.arity() {
            return Err(DiError::GenericArgsMismatch {
                definition: self.definition.name().to_string(),
                service: service_type.name().to_string(),
                expected: self.definition.arity(),
                actual: arguments.len(),
            });
        }

        let ids: Vec<TypeId> = arguments.iter().map(ServiceType::id).collect();
        let Some(variant) = self.variants.get(&ids) else {
            #[cfg(feature = "logging")]
            trace!(
                target: "scoped_injector",
                definition = self.definition.name(),
                service = service_type.name(),
                "No closed variant for requested type arguments"
            );
            return Ok(None);
        };

        let memo_key = (variant.implementation.id(), key.clone());
        if let Some(existing) = self.closed.get(&memo_key) {
            return Ok(Some(Arc::clone(existing.value())));
        }

        let closed = self
            .closed
            .entry(memo_key)
            .or_insert_with(|| {
                #[cfg(feature = "logging")]
                debug!(
                    target: "scoped_injector",
                    definition = self.definition.name(),
                    service = service_type.name(),
                    "Closing open-generic registration"
                );
                Arc::new(open.derive(Arc::clone(&variant.factory)))
            })
            .value()
            .clone();
        Ok(Some(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
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

    struct Pair<A, B>(PhantomData<(A, B)>);

    impl<A: Injectable, B: Injectable> ClosedGeneric for Pair<A, B> {
        type Definition = RepoDef;
        const ARITY: usize = 2;

        fn type_arguments() -> Vec<ServiceType> {
            vec![ServiceType::of::<A>(), ServiceType::of::<B>()]
        }
    }

    #[test]
    fn test_factory_ids_are_monotonic() {
        let a = Registration::delegate(|| 1u8);
        let b = Registration::delegate(|| 2u8);
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_setup_resolution_call_upgrade_is_one_way() {
        let setup = Setup::new();
        assert!(!setup.is_resolution_call());
        setup.force_resolution_call();
        assert!(setup.is_resolution_call());
        assert!(setup.clone().is_resolution_call());
    }

    #[test]
    fn test_setup_disposal() {
        struct Conn;
        impl Disposable for Conn {
            fn dispose(&self) -> Result<()> {
                Ok(())
            }
        }

        assert!(Setup::new().disposal().is_none());
        let setup = Setup::new().disposable::<Conn>().with_disposal_order(4);
        let disposal = setup.disposal().unwrap();
        assert_eq!(disposal.order(), Some(4));
        assert!(disposal.run(&(Arc::new(Conn) as Instance)).is_ok());
    }

    #[test]
    fn test_setup_metadata() {
        let setup = Setup::new().with_metadata("primary");
        assert_eq!(setup.metadata::<&str>(), Some(&"primary"));
        assert!(setup.metadata::<u32>().is_none());
    }

    #[test]
    fn test_can_serve_with_cast() {
        trait Named: Send + Sync {
            fn name(&self) -> &'static str;
        }
        struct Impl;
        impl Named for Impl {
            fn name(&self) -> &'static str {
                "impl"
            }
        }

        let registration = Registration::delegate(|| Impl).serves(|i: Arc<Impl>| i as Arc<dyn Named>);
        assert!(registration.can_serve(&ServiceType::of::<Impl>()));
        assert!(registration.can_serve(&ServiceType::of::<Arc<dyn Named>>()));
        assert!(!registration.can_serve(&ServiceType::of::<String>()));

        let cast = registration.cast_to(&ServiceType::of::<Arc<dyn Named>>()).unwrap();
        let converted = cast(Arc::new(Impl)).unwrap();
        let named = converted.downcast::<Arc<dyn Named>>().unwrap();
        assert_eq!(named.name(), "impl");
        assert!(registration.cast_to(&ServiceType::of::<Impl>()).is_none());
    }

    #[test]
    fn test_validate_rejects_unassignable() {
        let registration = Registration::delegate(|| 1u32);
        let err = registration
            .validate_for(&ServiceType::of::<String>(), &ServiceKey::Default)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAssignable);
        assert!(registration.validate_for(&ServiceType::of::<u32>(), &ServiceKey::Default).is_ok());
    }

    #[test]
    fn test_open_generic_validation() {
        let open = Registration::new(OpenGenericFactory::new(ServiceType::open::<RepoDef>(1)));
        assert!(open
            .validate_for(&ServiceType::open::<RepoDef>(1), &ServiceKey::Default)
            .is_ok());

        let err = open
            .validate_for(&ServiceType::open::<RepoDef>(2), &ServiceKey::Default)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericArgsMismatch);

        let err = open.validate_for(&ServiceType::of::<u8>(), &ServiceKey::Default).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAssignable);
    }

    #[test]
    fn test_open_generic_closing_is_memoised() {
        let open = Arc::new(Registration::new(
            OpenGenericFactory::new(ServiceType::open::<RepoDef>(1))
                .close_with::<Repo<u8>>(DelegateFactory::new(|| Repo::<u8>(PhantomData))),
        ));
        let closed_type = ServiceType::closed::<Repo<u8>>();

        let first = open
            .factory()
            .close_generic(&open, &closed_type, &ServiceKey::Default)
            .unwrap()
            .unwrap();
        let second = open
            .factory()
            .close_generic(&open, &closed_type, &ServiceKey::Default)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), open.id());
        assert_eq!(first.implementation_type(), Some(closed_type));

        let missing = open
            .factory()
            .close_generic(&open, &ServiceType::closed::<Repo<u16>>(), &ServiceKey::Default)
            .unwrap();
        assert!(missing.is_none());

        let err = open
            .factory()
            .close_generic(&open, &ServiceType::closed::<Pair<u8, u8>>(), &ServiceKey::Default)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenericArgsMismatch);
    }
}
