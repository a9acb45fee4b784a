//! The dependency injection container
//!
//! A [`Container`] publishes immutable [`Registry`] snapshots through an
//! `ArcSwap`: registration copies the current snapshot, applies the change and
//! swaps it in atomically, retrying on contention. Resolution reads one snapshot
//! for the whole call, consults its root cache, and otherwise plans the request
//! (see `resolver.rs`), caches the plan and runs it.
//!
//! `Container` is a cheap handle. Clones share the same core; a view returned by
//! [`Container::open_scope`] additionally carries the scope it is bound to.

use crate::provider::describe_key;
use crate::registry::Registry;
use crate::{
    ClosedGeneric, DiError, FactoryId, FactoryKind, FactoryRef, IfAlreadyRegistered, Injectable, Instance, Registration,
    Request, Result, Reuse, Rules, Scope, ScopeContext, ScopedContainer, ServiceInfo, ServiceKey, ServiceType,
    downcast_instance,
};
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

// =============================================================================
// Core
// =============================================================================

struct ContainerCore {
    registry: ArcSwap<Registry>,
    rules: Rules,
    singletons: Arc<Scope>,
    /// Children share the parent's singleton scope and never dispose it
    owns_singletons: bool,
    scope_context: Option<Arc<dyn ScopeContext>>,
    parent: Option<Container>,
    disposed: AtomicBool,
}

impl Drop for ContainerCore {
    fn drop(&mut self) {
        if !self.owns_singletons || self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(_err) = self.singletons.dispose() {
            #[cfg(feature = "logging")]
            warn!(
                target: "scoped_injector",
                error = %_err,
                "Singleton disposal reported an error when the container was dropped"
            );
        }
    }
}

/// Concurrent dependency injection container.
///
/// # Examples
///
/// ```rust
/// use scoped_injector::Container;
///
/// struct Database {
///     url: String,
/// }
///
/// let container = Container::new();
/// container.singleton(Database { url: "postgres://localhost".into() }).unwrap();
///
/// let db = container.get::<Database>().unwrap();
/// assert_eq!(db.url, "postgres://localhost");
/// ```
#[derive(Clone)]
pub struct Container {
    core: Arc<ContainerCore>,
    bound_scope: Option<Arc<Scope>>,
}

/// A weak handle to a container, used by deferred resolutions
#[derive(Clone)]
pub struct WeakContainer {
    core: Weak<ContainerCore>,
    bound_scope: Option<Arc<Scope>>,
}

impl WeakContainer {
    /// The container, unless it was dropped or disposed
    pub fn upgrade(&self) -> Result<Container> {
        let core = self.core.upgrade().ok_or(DiError::ContainerDisposed)?;
        if core.disposed.load(Ordering::Acquire) {
            return Err(DiError::ContainerDisposed);
        }
        Ok(Container {
            core,
            bound_scope: self.bound_scope.clone(),
        })
    }
}

impl fmt::Debug for WeakContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContainer")
            .field("alive", &(self.core.strong_count() > 0))
            .finish()
    }
}

/// One registration as listed by [`Container::registered_services`]
#[derive(Debug, Clone)]
pub struct RegisteredService {
    pub service: ServiceType,
    pub key: ServiceKey,
    pub factory: FactoryRef,
}

impl Container {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Create a root container with default [`Rules`].
    #[inline]
    pub fn new() -> Self {
        Self::build(Rules::default(), None)
    }

    /// Create a root container with the given rules.
    pub fn with_rules(rules: Rules) -> Self {
        Self::build(rules, None)
    }

    /// Create a root container that reads and sets the ambient current scope
    /// through `context`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::{Container, Rules, ThreadLocalScopeContext};
    /// use std::sync::Arc;
    ///
    /// struct Session;
    ///
    /// let container = Container::with_scope_context(Rules::default(), Arc::new(ThreadLocalScopeContext::new()));
    /// container.scoped(|| Session).unwrap();
    ///
    /// let scope = container.open_scope(None).unwrap();
    /// // The root handle sees the ambient scope too
    /// let a = container.get::<Session>().unwrap();
    /// let b = scope.get::<Session>().unwrap();
    /// assert!(Arc::ptr_eq(&a, &b));
    /// ```
    pub fn with_scope_context(rules: Rules, context: Arc<dyn ScopeContext>) -> Self {
        Self::build(rules, Some(context))
    }

    fn build(rules: Rules, scope_context: Option<Arc<dyn ScopeContext>>) -> Self {
        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            default_reuse = %rules.default_reuse(),
            scope_context = scope_context.is_some(),
            "Creating new root DI container"
        );

        let singletons = Scope::new(None, Some("singletons".into()), rules.wait_timeout());
        Self {
            core: Arc::new(ContainerCore {
                registry: ArcSwap::from_pointee(Registry::new()),
                rules,
                singletons,
                owns_singletons: true,
                scope_context,
                parent: None,
                disposed: AtomicBool::new(false),
            }),
            bound_scope: None,
        }
    }

    /// Create a child container with the same rules.
    ///
    /// The child starts with a copy of this container's registrations and
    /// falls back to this container for anything it cannot resolve itself.
    /// Singletons are shared with the parent.
    pub fn create_child(&self) -> Result<Container> {
        self.create_child_with_rules(self.core.rules.clone())
    }

    /// Create a child container with different rules
    pub fn create_child_with_rules(&self, rules: Rules) -> Result<Container> {
        self.ensure_alive()?;
        let registry = self.registry().copy();

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            registrations = registry.registration_count(),
            "Creating child container"
        );

        Ok(Self {
            core: Arc::new(ContainerCore {
                registry: ArcSwap::from_pointee(registry),
                rules,
                singletons: Arc::clone(&self.core.singletons),
                owns_singletons: false,
                scope_context: self.core.scope_context.clone(),
                parent: Some(self.clone()),
                disposed: AtomicBool::new(false),
            }),
            bound_scope: self.bound_scope.clone(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn rules(&self) -> &Rules {
        &self.core.rules
    }

    /// The scope holding singletons
    #[inline]
    pub fn singletons(&self) -> &Arc<Scope> {
        &self.core.singletons
    }

    /// The scope this view is bound to, else the ambient current scope
    pub fn current_scope(&self) -> Option<Arc<Scope>> {
        self.bound_scope
            .clone()
            .or_else(|| self.core.scope_context.as_ref().and_then(|context| context.current()))
    }

    /// The parent of a child container
    #[inline]
    pub fn parent(&self) -> Option<&Container> {
        self.core.parent.as_ref()
    }

    /// A view of this container bound to `scope`
    pub(crate) fn bound_to(&self, scope: Arc<Scope>) -> Container {
        Self {
            core: Arc::clone(&self.core),
            bound_scope: Some(scope),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakContainer {
        WeakContainer {
            core: Arc::downgrade(&self.core),
            bound_scope: self.bound_scope.clone(),
        }
    }

    #[inline]
    pub(crate) fn scope_context(&self) -> Option<&Arc<dyn ScopeContext>> {
        self.core.scope_context.as_ref()
    }

    /// The current registry snapshot
    #[inline]
    pub(crate) fn registry(&self) -> Arc<Registry> {
        self.core.registry.load_full()
    }

    #[inline]
    fn ensure_alive(&self) -> Result<()> {
        if self.core.disposed.load(Ordering::Acquire) {
            return Err(DiError::ContainerDisposed);
        }
        Ok(())
    }

    /// Publish the registry produced by `update`, retrying on contention.
    ///
    /// Returns `false` when `update` left the registry unchanged.
    fn update_registry<F>(&self, update: F) -> Result<bool>
    where
        F: Fn(&Registry) -> Result<Option<Registry>>,
    {
        self.ensure_alive()?;
        loop {
            let current = self.core.registry.load_full();
            let Some(next) = update(&current)? else {
                return Ok(false);
            };
            let previous = self.core.registry.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*previous, &current) {
                return Ok(true);
            }

            #[cfg(feature = "logging")]
            trace!(target: "scoped_injector", "Registry changed concurrently, retrying update");
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a service factory.
    ///
    /// `policy` defaults to the rules' conflict policy. Returns the factory id,
    /// or `None` when the policy kept an existing registration instead.
    pub fn register(
        &self,
        registration: Registration,
        service: ServiceType,
        key: Option<ServiceKey>,
        policy: Option<IfAlreadyRegistered>,
    ) -> Result<Option<FactoryId>> {
        let policy = policy.unwrap_or(self.core.rules.default_if_already_registered());
        let registration = registration.into_kind(FactoryKind::Service);
        registration.validate_for(&service, key.as_ref().unwrap_or(&ServiceKey::Default))?;

        let id = registration.id();
        let factory: FactoryRef = Arc::new(registration);
        let added = self.update_registry(|registry| registry.with_service(&service, key.clone(), Arc::clone(&factory), policy))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = service.name(),
            key = %describe_key(key.as_ref()),
            factory_id = id.get(),
            reuse = ?factory.reuse(),
            policy = ?policy,
            added = added,
            "Registering service"
        );

        Ok(added.then_some(id))
    }

    /// Register a factory for `T` with the default conflict policy
    #[inline]
    pub fn register_service<T: ?Sized + 'static>(&self, registration: Registration) -> Result<Option<FactoryId>> {
        self.register(registration, ServiceType::of::<T>(), None, None)
    }

    /// Register a factory for `T` under `key`
    #[inline]
    pub fn register_keyed<T: ?Sized + 'static>(&self, key: impl Into<ServiceKey>, registration: Registration) -> Result<Option<FactoryId>> {
        self.register(registration, ServiceType::of::<T>(), Some(key.into()), None)
    }

    /// Register a decorator for `T`
    #[inline]
    pub fn register_decorator<T: ?Sized + 'static>(&self, registration: Registration) -> Result<FactoryId> {
        self.register_decorator_for(ServiceType::of::<T>(), registration)
    }

    /// Register a decorator for a service type (or open-generic definition)
    pub fn register_decorator_for(&self, service: ServiceType, registration: Registration) -> Result<FactoryId> {
        let registration = registration.into_kind(FactoryKind::Decorator);
        registration.validate_for(&service, &ServiceKey::Default)?;
        self.add_decorator(Some(&service), registration)
    }

    /// Register a decorator applied to every service type.
    ///
    /// Such decorators see erased instances; use
    /// [`crate::DecoratorFactory::erased`] or a condition on the service type.
    pub fn register_decorator_for_any(&self, registration: Registration) -> Result<FactoryId> {
        self.add_decorator(None, registration.into_kind(FactoryKind::Decorator))
    }

    fn add_decorator(&self, service: Option<&ServiceType>, registration: Registration) -> Result<FactoryId> {
        let id = registration.id();
        let decorator: FactoryRef = Arc::new(registration);
        self.update_registry(|registry| registry.with_decorator(service, Arc::clone(&decorator)).map(Some))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = service.map_or("*", ServiceType::name),
            factory_id = id.get(),
            order = decorator.setup().order(),
            "Registering decorator"
        );

        Ok(id)
    }

    /// Register the wrapper factory for a service type or open definition.
    ///
    /// Wrappers are consulted when nothing is registered for the exact type.
    pub fn register_wrapper(&self, service: ServiceType, registration: Registration) -> Result<FactoryId> {
        let registration = registration.into_kind(FactoryKind::Wrapper);
        let id = registration.id();
        let wrapper: FactoryRef = Arc::new(registration);
        self.update_registry(|registry| registry.with_wrapper(&service, Arc::clone(&wrapper)).map(Some))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = service.name(),
            factory_id = id.get(),
            "Registering wrapper"
        );

        Ok(id)
    }

    /// Remove registrations; returns whether anything was removed.
    ///
    /// For services, no key removes every registration of the type and
    /// [`ServiceKey::Default`] removes all unkeyed ones.
    pub fn unregister(&self, service: &ServiceType, key: Option<&ServiceKey>, kind: FactoryKind) -> Result<bool> {
        self.unregister_where(service, key, kind, |_| true)
    }

    /// Remove the registrations that also satisfy `predicate`
    pub fn unregister_where<P>(&self, service: &ServiceType, key: Option<&ServiceKey>, kind: FactoryKind, predicate: P) -> Result<bool>
    where
        P: Fn(&FactoryRef) -> bool,
    {
        let removed = self.update_registry(|registry| registry.without(service, key, kind, &predicate))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = service.name(),
            key = %describe_key(key),
            kind = ?kind,
            removed = removed,
            "Unregistering"
        );

        Ok(removed)
    }

    /// Whether this container has a registration of `kind` for the service
    #[inline]
    pub fn is_registered(&self, service: &ServiceType, key: Option<&ServiceKey>, kind: FactoryKind) -> bool {
        self.registry().contains(service, key, kind)
    }

    /// Whether `T` is registered here or in a parent container
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.is_registered(&ServiceType::of::<T>(), None, FactoryKind::Service)
            || self.parent().is_some_and(Container::contains::<T>)
    }

    // ===== Typed shortcuts (replace existing defaults) =====

    /// Register a ready instance as the singleton `T`.
    pub fn singleton<T: Injectable>(&self, instance: T) -> Result<()> {
        self.replace::<T>(Registration::instance(instance))
    }

    /// Register a singleton `T` created on first use.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::Container;
    ///
    /// struct Cache {
    ///     entries: Vec<u8>,
    /// }
    ///
    /// let container = Container::new();
    /// container.lazy(|| Cache { entries: vec![0; 1024] }).unwrap();
    /// assert_eq!(container.get::<Cache>().unwrap().entries.len(), 1024);
    /// ```
    pub fn lazy<T, F>(&self, create: F) -> Result<()>
    where
        T: Injectable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.replace::<T>(Registration::delegate(create).with_reuse(Reuse::Singleton))
    }

    /// Register a transient `T`: a new instance on every resolve.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::Container;
    /// use std::sync::atomic::{AtomicU64, Ordering};
    ///
    /// static COUNTER: AtomicU64 = AtomicU64::new(0);
    ///
    /// struct RequestId(u64);
    ///
    /// let container = Container::new();
    /// container.transient(|| RequestId(COUNTER.fetch_add(1, Ordering::SeqCst))).unwrap();
    ///
    /// let a = container.get::<RequestId>().unwrap();
    /// let b = container.get::<RequestId>().unwrap();
    /// assert_ne!(a.0, b.0);
    /// ```
    pub fn transient<T, F>(&self, create: F) -> Result<()>
    where
        T: Injectable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.replace::<T>(Registration::delegate(create).with_reuse(Reuse::Transient))
    }

    /// Register a `T` shared within each open scope
    pub fn scoped<T, F>(&self, create: F) -> Result<()>
    where
        T: Injectable,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.replace::<T>(Registration::delegate(create).with_reuse(Reuse::scoped()))
    }

    fn replace<T: Injectable>(&self, registration: Registration) -> Result<()> {
        self.register(registration, ServiceType::of::<T>(), None, Some(IfAlreadyRegistered::Replace))
            .map(|_| ())
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve an erased instance; `Ok(None)` only when the request's
    /// [`crate::IfUnresolved`] policy allows an empty result.
    #[inline]
    pub fn resolve(&self, info: &ServiceInfo) -> Result<Option<Instance>> {
        self.resolve_in(self.registry(), info, Vec::new())
    }

    /// Resolve with per-call arguments.
    ///
    /// Any dependency below the root whose type matches an argument receives
    /// that argument. Such resolutions are never cached.
    pub fn resolve_with_args(&self, info: &ServiceInfo, args: Vec<Instance>) -> Result<Option<Instance>> {
        self.resolve_in(self.registry(), info, args)
    }

    pub(crate) fn resolve_in(&self, registry: Arc<Registry>, info: &ServiceInfo, args: Vec<Instance>) -> Result<Option<Instance>> {
        self.ensure_alive()?;
        let service = info.service_type();
        let cacheable = args.is_empty() && info.required_type().is_none();

        if cacheable {
            if let Some(entry) = registry.cached(service, info.key()) {
                #[cfg(feature = "logging")]
                trace!(
                    target: "scoped_injector",
                    service = info.service_type().name(),
                    key = %describe_key(info.key()),
                    "Resolved from root cache"
                );
                return entry.execute(self);
            }
        }

        let root = Request::root_in(self, Arc::clone(&registry), args);
        let plan = self.plan_for(&root.push(info.clone()))?;

        if cacheable && !root.is_uncacheable() {
            if let Some(entry) = registry.cache(service, info.key(), plan.clone()) {
                #[cfg(feature = "logging")]
                trace!(
                    target: "scoped_injector",
                    service = info.service_type().name(),
                    key = %describe_key(info.key()),
                    "Cached root plan"
                );
                return entry.execute(self);
            }
        }
        plan.execute(self)
    }

    /// Resolve `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::{Container, ErrorCode};
    ///
    /// struct Missing;
    ///
    /// let container = Container::new();
    /// let err = container.get::<Missing>().err().unwrap();
    /// assert_eq!(err.code(), ErrorCode::NotRegistered);
    /// ```
    #[inline]
    pub fn get<T: Injectable>(&self) -> Result<Arc<T>> {
        self.get_with::<T>(&ServiceInfo::of::<T>())
    }

    /// Resolve `T` described by `info` (key, required type, policy)
    pub fn get_with<T: Injectable>(&self, info: &ServiceInfo) -> Result<Arc<T>> {
        let instance = self.resolve(info)?.ok_or_else(|| {
            DiError::not_registered(
                info.service_type().name(),
                describe_key(info.key()),
                "The request allowed an empty result.",
            )
        })?;
        downcast_instance(instance, info.service_type())
    }

    /// Resolve `T`, or `None` when nothing serves it
    pub fn try_get<T: Injectable>(&self) -> Result<Option<Arc<T>>> {
        let service = ServiceType::of::<T>();
        self.resolve(&ServiceInfo::new(service.clone()).optional())?
            .map(|instance| downcast_instance(instance, &service))
            .transpose()
    }

    /// Resolve `T` registered under `key`
    #[inline]
    pub fn get_keyed<T: Injectable>(&self, key: impl Into<ServiceKey>) -> Result<Arc<T>> {
        self.get_with::<T>(&ServiceInfo::of::<T>().keyed(key))
    }

    /// Resolve a closed generic `T`, falling back to open-generic registrations
    #[inline]
    pub fn get_generic<T: ClosedGeneric>(&self) -> Result<Arc<T>> {
        self.get_with::<T>(&ServiceInfo::of_closed::<T>())
    }

    /// All instances serving `info`, in registration order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::{Container, Registration};
    ///
    /// struct Plugin(&'static str);
    ///
    /// let container = Container::new();
    /// container.register_service::<Plugin>(Registration::delegate(|| Plugin("a"))).unwrap();
    /// container.register_service::<Plugin>(Registration::delegate(|| Plugin("b"))).unwrap();
    ///
    /// let names: Vec<_> = container
    ///     .resolve_all::<Plugin>()
    ///     .unwrap()
    ///     .iter()
    ///     .map(|plugin| plugin.0)
    ///     .collect();
    /// assert_eq!(names, ["a", "b"]);
    /// ```
    pub fn resolve_many(&self, info: ServiceInfo) -> ResolveMany {
        ResolveMany {
            container: self.clone(),
            info,
            snapshot: None,
        }
    }

    /// Resolve every `T`.
    ///
    /// Decorators registered for `Vec<Arc<T>>` are applied to the collected
    /// instances, in the same order as decorators of a single service.
    pub fn resolve_all<T: Injectable>(&self) -> Result<Vec<Arc<T>>> {
        let service = ServiceType::of::<T>();
        let items = self
            .resolve_many(ServiceInfo::new(service.clone()))
            .iter()?
            .map(|instance| instance.and_then(|instance| downcast_instance(instance, &service)))
            .collect::<Result<Vec<Arc<T>>>>()?;
        self.decorate_collection(items)
    }

    fn decorate_collection<T: Injectable>(&self, items: Vec<Arc<T>>) -> Result<Vec<Arc<T>>> {
        let collection = ServiceType::of::<Vec<Arc<T>>>();
        let registry = self.registry();
        if !registry.has_decorators(collection.id()) {
            return Ok(items);
        }

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_injector",
            service = collection.name(),
            count = items.len(),
            "Decorating collection"
        );

        let root = Request::seeded(self, Arc::clone(&registry), Arc::new(items));
        let plan = self.plan_for(&root.push(ServiceInfo::new(collection.clone())))?;
        let decorated = plan.execute(self)?.ok_or_else(|| {
            DiError::not_registered(collection.name(), describe_key(None), "A collection decorator produced nothing.")
        })?;
        Ok(Arc::unwrap_or_clone(downcast_instance::<Vec<Arc<T>>>(decorated, &collection)?))
    }

    // =========================================================================
    // Scopes and lifecycle
    // =========================================================================

    /// Supply a pre-built `T` for the current scope (or the container when no
    /// scope is open). It takes precedence over registrations of `T`.
    pub fn use_instance<T: Injectable>(&self, instance: T) -> Result<()> {
        self.ensure_alive()?;
        let service = ServiceType::of::<T>();
        let scope = self.current_scope().unwrap_or_else(|| Arc::clone(&self.core.singletons));
        scope.use_instance(&service, Arc::new(instance))?;
        self.update_registry(|registry| Ok(registry.with_used(&service)))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = service.name(),
            scope = %scope,
            "Using instance"
        );

        Ok(())
    }

    /// Open a scope nested in the current one.
    ///
    /// The returned guard resolves inside the new scope and disposes it on
    /// drop. With a [`ScopeContext`] the scope also becomes the ambient current
    /// scope until the guard is released.
    pub fn open_scope(&self, name: Option<&str>) -> Result<ScopedContainer> {
        self.ensure_alive()?;
        let parent = self.current_scope().unwrap_or_else(|| Arc::clone(&self.core.singletons));
        if parent.is_disposed() {
            return Err(DiError::scope_disposed(parent.as_ref()));
        }

        let scope = Scope::new(Some(parent), name.map(Into::into), self.core.rules.wait_timeout());
        let previous = self
            .core
            .scope_context
            .as_ref()
            .map(|context| context.set_current(Some(Arc::clone(&scope))));

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            scope = %scope,
            ambient = previous.is_some(),
            "Opened scope"
        );

        Ok(ScopedContainer::new(self.bound_to(Arc::clone(&scope)), scope, previous))
    }

    /// Dispose the container: its singletons are disposed (child scopes first,
    /// then ordered disposers, then the rest in reverse creation order) and
    /// every later operation fails with [`DiError::ContainerDisposed`].
    ///
    /// Idempotent.
    pub fn dispose(&self) -> Result<()> {
        if self.core.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            owns_singletons = self.core.owns_singletons,
            "Disposing container"
        );

        if self.core.owns_singletons {
            self.core.singletons.dispose()
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::Acquire)
    }

    /// Reject further registration changes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_injector::{Container, ErrorCode};
    ///
    /// let container = Container::new();
    /// container.singleton(1u32).unwrap();
    /// container.lock().unwrap();
    ///
    /// let err = container.singleton(2u32).unwrap_err();
    /// assert_eq!(err.code(), ErrorCode::RegistrationLocked);
    /// assert_eq!(*container.get::<u32>().unwrap(), 1);
    /// ```
    pub fn lock(&self) -> Result<()> {
        let _newly_locked = self.update_registry(|registry| Ok((!registry.is_locked()).then(|| registry.locked())))?;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            newly_locked = _newly_locked,
            registrations = self.len(),
            "Container locked"
        );

        Ok(())
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.registry().is_locked()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Every service registration, in registration order
    pub fn registered_services(&self) -> Vec<RegisteredService> {
        let registry = self.registry();
        let mut services: Vec<RegisteredService> = registry
            .entries()
            .flat_map(|entry| {
                entry.factories().iter().map(|(key, factory)| RegisteredService {
                    service: entry.service().clone(),
                    key: key.clone(),
                    factory: Arc::clone(factory),
                })
            })
            .collect();
        services.sort_by_key(|registered| registered.factory.id());
        services
    }

    /// Number of registrations (services, decorators and wrappers)
    #[inline]
    pub fn len(&self) -> usize {
        self.registry().registration_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registrations", &self.len())
            .field("locked", &self.is_locked())
            .field("disposed", &self.is_disposed())
            .field("bound_scope", &self.bound_scope.as_ref().map(|scope| scope.id()))
            .field("has_parent", &self.core.parent.is_some())
            .finish()
    }
}

// =============================================================================
// Resolve many
// =============================================================================

/// A restartable sequence of every instance serving a request.
///
/// Each call to [`ResolveMany::iter`] reads the container's current
/// registrations, unless [`ResolveMany::snapshot`] pinned them.
#[derive(Clone)]
pub struct ResolveMany {
    container: Container,
    info: ServiceInfo,
    snapshot: Option<Arc<Registry>>,
}

impl ResolveMany {
    /// Pin the registrations as they are now
    pub fn snapshot(mut self) -> Self {
        self.snapshot = Some(self.container.registry());
        self
    }

    /// Start enumerating
    pub fn iter(&self) -> Result<ResolveManyIter> {
        let registry = self.snapshot.clone().unwrap_or_else(|| self.container.registry());
        let mut candidates = self
            .container
            .candidates(&registry, self.info.service_type(), self.info.key())?;
        candidates.sort_by_key(|(_, factory)| factory.id());

        let keys: Vec<ServiceKey> = candidates.into_iter().map(|(key, _)| key).collect();
        Ok(ResolveManyIter {
            container: self.container.clone(),
            registry,
            info: self.info.clone(),
            keys: keys.into_iter(),
        })
    }

    /// Collect every instance
    pub fn to_vec(&self) -> Result<Vec<Instance>> {
        self.iter()?.collect()
    }
}

impl fmt::Debug for ResolveMany {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveMany")
            .field("info", &self.info)
            .field("snapshot", &self.snapshot.is_some())
            .finish()
    }
}

/// Iterator over [`ResolveMany`] results; candidates that turn out not to
/// match (for example a false condition) are skipped.
pub struct ResolveManyIter {
    container: Container,
    registry: Arc<Registry>,
    info: ServiceInfo,
    keys: std::vec::IntoIter<ServiceKey>,
}

impl Iterator for ResolveManyIter {
    type Item = Result<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let mut info = ServiceInfo::new(self.info.service_type().clone()).keyed(key).optional();
            if let Some(required) = self.info.required_type() {
                info = info.required(required.clone());
            }
            match self.container.resolve_in(Arc::clone(&self.registry), &info, Vec::new()) {
                Ok(Some(instance)) => return Some(Ok(instance)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DelegateFactory, ErrorCode, Setup, ThreadLocalScopeContext};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[derive(Debug)]
    struct Config {
        name: &'static str,
    }

    #[derive(Debug)]
    struct Counter(u32);

    fn counting(calls: &Arc<AtomicU32>) -> impl Fn() -> Counter + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || Counter(calls.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn test_singleton() {
        let container = Container::new();
        container.singleton(Config { name: "app" }).unwrap();

        let a = container.get::<Config>().unwrap();
        let b = container.get::<Config>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name, "app");
    }

    #[test]
    fn test_lazy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        container.lazy(counting(&calls)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let a = container.get::<Counter>().unwrap();
        let b = container.get::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        container.transient(counting(&calls)).unwrap();

        let a = container.get::<Counter>().unwrap();
        let b = container.get::<Counter>().unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn test_not_found() {
        let container = Container::new();
        let err = container.get::<Config>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotRegistered);
        assert!(container.try_get::<Config>().unwrap().is_none());
    }

    #[test]
    fn test_keep_policy_reports_no_registration() {
        let container = Container::new();
        let first = container
            .register(
                Registration::delegate(|| Config { name: "a" }),
                ServiceType::of::<Config>(),
                None,
                Some(IfAlreadyRegistered::Keep),
            )
            .unwrap();
        let second = container
            .register(
                Registration::delegate(|| Config { name: "b" }),
                ServiceType::of::<Config>(),
                None,
                Some(IfAlreadyRegistered::Keep),
            )
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(container.get::<Config>().unwrap().name, "a");
    }

    #[test]
    fn test_scopes_get_distinct_instances() {
        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        container.scoped(counting(&calls)).unwrap();

        let first = container.open_scope(None).unwrap();
        let second = container.open_scope(None).unwrap();
        let a1 = first.get::<Counter>().unwrap();
        let a2 = first.get::<Counter>().unwrap();
        let b = second.get::<Counter>().unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(container.get::<Counter>().unwrap_err().code(), ErrorCode::NoCurrentScope);
    }

    #[test]
    fn test_nested_named_scope() {
        let container = Container::new();
        container
            .register_service::<Counter>(Registration::delegate(|| Counter(1)).with_reuse(Reuse::scoped_to("session")))
            .unwrap();

        let session = container.open_scope(Some("session")).unwrap();
        let request = session.open_scope(Some("request")).unwrap();
        let from_request = request.get::<Counter>().unwrap();
        let from_session = session.get::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&from_request, &from_session));

        let unnamed = container.open_scope(None).unwrap();
        assert_eq!(unnamed.get::<Counter>().unwrap_err().code(), ErrorCode::NoMatchingScopeName);
    }

    #[test]
    fn test_ambient_scope_context() {
        let container = Container::with_scope_context(Rules::default(), Arc::new(ThreadLocalScopeContext::new()));
        container.scoped(|| Config { name: "scoped" }).unwrap();
        assert!(container.current_scope().is_none());

        {
            let scope = container.open_scope(None).unwrap();
            assert!(Arc::ptr_eq(&container.current_scope().unwrap(), scope.scope()));
            let a = container.get::<Config>().unwrap();
            let b = scope.get::<Config>().unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        }
        assert!(container.current_scope().is_none());
    }

    #[test]
    fn test_dispose_container() {
        let container = Container::new();
        container.singleton(Config { name: "x" }).unwrap();
        container.dispose().unwrap();
        container.dispose().unwrap();

        assert!(container.is_disposed());
        assert_eq!(container.get::<Config>().unwrap_err().code(), ErrorCode::ContainerDisposed);
        assert_eq!(container.singleton(1u8).unwrap_err().code(), ErrorCode::ContainerDisposed);
        assert!(container.open_scope(None).is_err());
    }

    #[test]
    fn test_lock() {
        let container = Container::new();
        container.singleton(1u32).unwrap();
        assert!(!container.is_locked());

        container.lock().unwrap();
        container.lock().unwrap();
        assert!(container.is_locked());
        assert_eq!(container.transient(|| 2u64).unwrap_err().code(), ErrorCode::RegistrationLocked);
        assert_eq!(*container.get::<u32>().unwrap(), 1);
    }

    #[test]
    fn test_unregister_invalidates_cached_plan() {
        let container = Container::new();
        container.transient(|| Config { name: "t" }).unwrap();
        for _ in 0..3 {
            container.get::<Config>().unwrap();
        }

        assert!(container
            .unregister(&ServiceType::of::<Config>(), None, FactoryKind::Service)
            .unwrap());
        assert!(!container
            .unregister(&ServiceType::of::<Config>(), None, FactoryKind::Service)
            .unwrap());
        assert!(container.resolve(&ServiceInfo::of::<Config>().optional()).unwrap().is_none());
    }

    #[test]
    fn test_resolve_many_is_restartable() {
        let container = Container::new();
        container.register_service::<Config>(Registration::delegate(|| Config { name: "a" })).unwrap();
        container.register_service::<Config>(Registration::delegate(|| Config { name: "b" })).unwrap();

        let many = container.resolve_many(ServiceInfo::of::<Config>());
        let pinned = container.resolve_many(ServiceInfo::of::<Config>()).snapshot();
        assert_eq!(many.to_vec().unwrap().len(), 2);

        container.register_keyed::<Config>("c", Registration::delegate(|| Config { name: "c" })).unwrap();
        let names: Vec<&str> = many
            .iter()
            .unwrap()
            .map(|instance| instance.unwrap().downcast::<Config>().unwrap().name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(pinned.to_vec().unwrap().len(), 2);

        assert_eq!(container.get::<Config>().unwrap_err().code(), ErrorCode::Ambiguous);
    }

    #[test]
    fn test_resolve_many_skips_false_conditions() {
        let container = Container::new();
        container.register_service::<Config>(Registration::delegate(|| Config { name: "a" })).unwrap();
        container
            .register_service::<Config>(
                Registration::delegate(|| Config { name: "hidden" }).with_setup(Setup::new().with_condition(|_| false)),
            )
            .unwrap();

        let all = container.resolve_all::<Config>().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "a");
    }

    #[test]
    fn test_resolve_with_args() {
        struct Greeting(String);

        let container = Container::new();
        container
            .register_service::<Greeting>(Registration::new(DelegateFactory::with_dependencies(
                vec![ServiceInfo::of::<String>()],
                |args| Ok(Greeting(format!("hello {}", args.get::<String>(0)?))),
            )))
            .unwrap();

        let instance = container
            .resolve_with_args(&ServiceInfo::of::<Greeting>(), vec![Arc::new(String::from("bob")) as Instance])
            .unwrap()
            .unwrap();
        assert_eq!(instance.downcast::<Greeting>().unwrap().0, "hello bob");

        let instance = container
            .resolve_with_args(&ServiceInfo::of::<Greeting>(), vec![Arc::new(String::from("eve")) as Instance])
            .unwrap()
            .unwrap();
        assert_eq!(instance.downcast::<Greeting>().unwrap().0, "hello eve");
    }

    #[test]
    fn test_use_instance_overrides_registration() {
        let container = Container::new();
        container.transient(|| Config { name: "registered" }).unwrap();
        assert_eq!(container.get::<Config>().unwrap().name, "registered");

        let scope = container.open_scope(None).unwrap();
        scope.use_instance(Config { name: "used" }).unwrap();
        assert_eq!(scope.get::<Config>().unwrap().name, "used");
        assert_eq!(container.get::<Config>().unwrap().name, "registered");
    }

    #[test]
    fn test_child_container_falls_back_to_parent() {
        let parent = Container::new();
        parent.singleton(Config { name: "parent" }).unwrap();

        let child = parent.create_child().unwrap();
        child.singleton(7u32).unwrap();
        parent.lazy(|| 9u64).unwrap();

        assert!(Arc::ptr_eq(&child.get::<Config>().unwrap(), &parent.get::<Config>().unwrap()));
        assert_eq!(*child.get::<u32>().unwrap(), 7);
        assert_eq!(*child.get::<u64>().unwrap(), 9);
        assert!(parent.try_get::<u32>().unwrap().is_none());
        assert!(child.contains::<u64>());

        child.dispose().unwrap();
        assert!(!parent.is_disposed());
        assert_eq!(parent.get::<Config>().unwrap().name, "parent");
    }

    #[test]
    fn test_concurrent_singleton_creation() {
        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        let probe = Arc::clone(&calls);
        container
            .lazy(move || {
                probe.fetch_add(1, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(5));
                Config { name: "shared" }
            })
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let container = container.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    container.get::<Config>().unwrap()
                })
            })
            .collect();
        let instances: Vec<Arc<Config>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn test_concurrent_registration_is_not_lost() {
        let container = Container::new();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let container = container.clone();
                thread::spawn(move || {
                    container
                        .register_keyed::<u64>(i, Registration::delegate(move || i))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(container.len(), 8);
        assert_eq!(*container.get_keyed::<u64>(5u64).unwrap(), 5);
    }

    #[test]
    fn test_registered_services_listing() {
        let container = Container::new();
        container.singleton(1u8).unwrap();
        container.register_keyed::<u8>("two", Registration::delegate(|| 2u8)).unwrap();

        let listed = container.registered_services();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].key, ServiceKey::Default);
        assert_eq!(listed[1].key, ServiceKey::named("two"));
        assert!(listed[0].factory.id() < listed[1].factory.id());
    }
}
