//! Factory registry and resolution caches
//!
//! A [`Registry`] is an immutable snapshot: every registration builds a new one
//! (copying the maps, sharing the entries) and the container publishes it
//! atomically. Each snapshot owns its caches, so replacing the snapshot is what
//! invalidates them.

use crate::plan::CompiledPlan;
use crate::{
    Container, DiError, FactoryId, FactoryKind, FactoryRef, Instance, Plan, Result, Reuse, ReuseTarget,
    ServiceKey, ServiceType,
};
use ahash::RandomState;
use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "logging")]
use tracing::trace;

/// Number of cache shards (shard = hash & 15)
const CACHE_SHARDS: usize = 16;

/// Marker type keying decorators that apply to every service type
struct AnyService;

/// Policy when a registration collides with an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IfAlreadyRegistered {
    /// Append another default; an explicit key collision is an error
    #[default]
    AppendNotKeyed,
    /// Any collision is an error
    Throw,
    /// Keep the existing registration
    Keep,
    /// Replace the existing registration(s)
    Replace,
    /// Append unless the same implementation type is already registered
    AppendNewImplementation,
}

// =============================================================================
// Entries
// =============================================================================

/// All factories registered for one service type, in registration order
#[derive(Clone)]
pub(crate) struct ServiceEntry {
    service: ServiceType,
    factories: Arc<Vec<(ServiceKey, FactoryRef)>>,
    next_index: u32,
}

impl ServiceEntry {
    fn new(service: ServiceType, key: ServiceKey, factory: FactoryRef) -> Self {
        Self {
            service,
            factories: Arc::new(vec![(key, factory)]),
            next_index: 1,
        }
    }

    #[inline]
    pub(crate) fn service(&self) -> &ServiceType {
        &self.service
    }

    #[inline]
    pub(crate) fn factories(&self) -> &[(ServiceKey, FactoryRef)] {
        &self.factories
    }

    /// The only factory, when the entry is a single default registration
    pub(crate) fn single(&self) -> Option<&FactoryRef> {
        match self.factories.as_slice() {
            [(ServiceKey::Default, factory)] => Some(factory),
            _ => None,
        }
    }

    pub(crate) fn keyed(&self, key: &ServiceKey) -> Option<&FactoryRef> {
        self.factories.iter().find(|(k, _)| k == key).map(|(_, f)| f)
    }
}

pub(crate) fn same_implementation(a: &FactoryRef, b: &FactoryRef) -> bool {
    matches!((a.implementation_type(), b.implementation_type()), (Some(x), Some(y)) if x == y)
}

// =============================================================================
// Caches
// =============================================================================

const STATE_PLAN: u8 = 0;
const STATE_COMPILING: u8 = 1;
const STATE_COMPILED: u8 = 2;

/// A cached plan moving forward through plan, compiling and compiled.
pub(crate) struct CacheEntry {
    plan: Plan,
    state: AtomicU8,
    compiled: OnceCell<CompiledPlan>,
}

impl CacheEntry {
    fn new(plan: Plan) -> Self {
        Self {
            plan,
            state: AtomicU8::new(STATE_PLAN),
            compiled: OnceCell::new(),
        }
    }

    /// Run the entry. The first hit after caching compiles the plan; callers that
    /// lose the race interpret the plan meanwhile.
    pub(crate) fn execute(&self, container: &Container) -> Result<Option<Instance>> {
        match self.state.load(Ordering::Acquire) {
            STATE_COMPILED => {
                if let Some(compiled) = self.compiled.get() {
                    return compiled(container);
                }
            }
            STATE_PLAN => {
                if self
                    .state
                    .compare_exchange(STATE_PLAN, STATE_COMPILING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let compiled = self.compiled.get_or_init(|| self.plan.compile());
                    self.state.store(STATE_COMPILED, Ordering::Release);

                    #[cfg(feature = "logging")]
                    trace!(target: "scoped_injector", "Compiled cached plan");

                    return compiled(container);
                }
            }
            _ => {}
        }
        self.plan.execute(container)
    }

    #[cfg(test)]
    fn is_compiled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_COMPILED
    }
}

/// Persistent list of keyed entries for one service type
struct KeyedNode {
    key: ServiceKey,
    entry: Arc<CacheEntry>,
    next: Option<Arc<KeyedNode>>,
}

impl KeyedNode {
    fn find(&self, key: &ServiceKey) -> Option<Arc<CacheEntry>> {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.key == *key {
                return Some(Arc::clone(&current.entry));
            }
            node = current.next.as_deref();
        }
        None
    }
}

/// A plan cached per factory id together with the reuse it was built for
struct ExpressionEntry {
    plan: Plan,
    reuse: Reuse,
    tracked: Option<ReuseTarget>,
}

type ShardMap<K, V> = HashMap<K, V, RandomState>;

/// 16 copy-on-write maps behind `ArcSwap`
struct Shards<K, V> {
    shards: [ArcSwap<ShardMap<K, V>>; CACHE_SHARDS],
    hasher: RandomState,
}

impl<K: Hash + Eq + Clone, V: Clone> Shards<K, V> {
    fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| ArcSwap::from_pointee(HashMap::with_hasher(RandomState::new()))),
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &ArcSwap<ShardMap<K, V>> {
        let index = (self.hasher.hash_one(key) as usize) & (CACHE_SHARDS - 1);
        &self.shards[index]
    }

    #[inline]
    fn get(&self, key: &K) -> Option<V> {
        self.shard(key).load().get(key).cloned()
    }

    fn update<F>(&self, key: &K, update: F)
    where
        F: Fn(Option<&V>) -> V,
    {
        self.shard(key).rcu(|map| {
            let mut map = ShardMap::clone(map);
            let value = update(map.get(key));
            map.insert(key.clone(), value);
            map
        });
    }
}

/// Root cache key.
///
/// A closed generic request also matches its open definition's registrations,
/// which a plain request for the same `TypeId` does not, so the two are kept apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct RootKey {
    service: TypeId,
    definition: Option<TypeId>,
}

impl RootKey {
    #[inline]
    fn of(service: &ServiceType) -> Self {
        Self {
            service: service.id(),
            definition: service.closed_definition_id(),
        }
    }
}

struct Caches {
    default: Shards<RootKey, Arc<CacheEntry>>,
    keyed: Shards<RootKey, Arc<KeyedNode>>,
    expressions: Shards<FactoryId, Arc<ExpressionEntry>>,
}

impl Caches {
    fn new() -> Self {
        Self {
            default: Shards::new(),
            keyed: Shards::new(),
            expressions: Shards::new(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

type TypeMap<V> = HashMap<TypeId, V, RandomState>;

/// Immutable registry snapshot
pub(crate) struct Registry {
    services: Arc<TypeMap<ServiceEntry>>,
    decorators: Arc<TypeMap<Arc<[FactoryRef]>>>,
    wrappers: Arc<TypeMap<FactoryRef>>,
    used: Arc<HashSet<TypeId, RandomState>>,
    locked: bool,
    caches: Arc<Caches>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            services: Arc::new(HashMap::with_hasher(RandomState::new())),
            decorators: Arc::new(HashMap::with_hasher(RandomState::new())),
            wrappers: Arc::new(HashMap::with_hasher(RandomState::new())),
            used: Arc::new(HashSet::with_hasher(RandomState::new())),
            locked: false,
            caches: Arc::new(Caches::new()),
        }
    }

    /// A snapshot with the same content and fresh caches
    fn rebuilt(&self) -> Self {
        Self {
            services: Arc::clone(&self.services),
            decorators: Arc::clone(&self.decorators),
            wrappers: Arc::clone(&self.wrappers),
            used: Arc::clone(&self.used),
            locked: self.locked,
            caches: Arc::new(Caches::new()),
        }
    }

    /// Copy for a child container: fresh caches, open for changes
    pub(crate) fn copy(&self) -> Self {
        Self {
            locked: false,
            ..self.rebuilt()
        }
    }

    fn ensure_unlocked(&self, service: &ServiceType) -> Result<()> {
        if self.locked {
            return Err(DiError::RegistrationLocked {
                service: service.name().to_string(),
            });
        }
        Ok(())
    }

    // ===== Queries =====

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of registrations of any kind
    pub(crate) fn registration_count(&self) -> usize {
        self.services.values().map(|e| e.factories.len()).sum::<usize>()
            + self.decorators.values().map(|d| d.len()).sum::<usize>()
            + self.wrappers.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.services.is_empty() && self.decorators.is_empty() && self.wrappers.is_empty()
    }

    #[inline]
    pub(crate) fn entry(&self, service: TypeId) -> Option<&ServiceEntry> {
        self.services.get(&service)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    /// Decorators registered for any of the given types, plus any-type
    /// decorators when `include_any` is set
    pub(crate) fn decorators_for(&self, types: &[TypeId], include_any: bool) -> Vec<FactoryRef> {
        if self.decorators.is_empty() {
            return Vec::new();
        }
        let any = include_any.then(TypeId::of::<AnyService>);
        let mut found: Vec<FactoryRef> = Vec::new();
        for id in types.iter().copied().chain(any) {
            if let Some(list) = self.decorators.get(&id) {
                for decorator in list.iter() {
                    if !found.iter().any(|f| f.id() == decorator.id()) {
                        found.push(Arc::clone(decorator));
                    }
                }
            }
        }
        found
    }

    /// Whether decorators are registered for exactly this type
    #[inline]
    pub(crate) fn has_decorators(&self, service: TypeId) -> bool {
        self.decorators.contains_key(&service)
    }

    #[inline]
    pub(crate) fn wrapper(&self, service: TypeId) -> Option<&FactoryRef> {
        self.wrappers.get(&service)
    }

    #[inline]
    pub(crate) fn has_used_instances(&self, service: TypeId) -> bool {
        self.used.contains(&service)
    }

    /// Whether a registration of `kind` exists for the service (and key)
    pub(crate) fn contains(&self, service: &ServiceType, key: Option<&ServiceKey>, kind: FactoryKind) -> bool {
        match kind {
            FactoryKind::Service => self.services.get(&service.id()).is_some_and(|entry| match key {
                None => true,
                Some(ServiceKey::Default) => entry.factories.iter().any(|(k, _)| k.is_default_like()),
                Some(key) => entry.keyed(key).is_some(),
            }),
            FactoryKind::Decorator => self.decorators.contains_key(&service.id()),
            FactoryKind::Wrapper => self.wrappers.contains_key(&service.id()),
        }
    }

    // ===== Structural changes =====

    /// Add a service registration; `None` when the policy leaves the registry unchanged
    pub(crate) fn with_service(
        &self,
        service: &ServiceType,
        key: Option<ServiceKey>,
        factory: FactoryRef,
        policy: IfAlreadyRegistered,
    ) -> Result<Option<Registry>> {
        self.ensure_unlocked(service)?;
        let key = key.unwrap_or_default();

        let entry = match self.services.get(&service.id()) {
            None => ServiceEntry::new(service.clone(), key, factory),
            Some(existing) => {
                let mut entry = existing.clone();
                let mut factories = existing.factories.as_ref().clone();
                if key == ServiceKey::Default {
                    let defaults: Vec<&FactoryRef> = factories
                        .iter()
                        .filter(|(k, _)| k.is_default_like())
                        .map(|(_, f)| f)
                        .collect();
                    match (defaults.first(), policy) {
                        (None, _) => factories.push((ServiceKey::Default, factory)),
                        (Some(_), IfAlreadyRegistered::AppendNotKeyed) => {
                            factories.push((ServiceKey::Indexed(entry.next_index), factory));
                            entry.next_index += 1;
                        }
                        (Some(first), IfAlreadyRegistered::Throw) => {
                            return Err(DiError::DuplicateDefault {
                                service: service.name().to_string(),
                                existing: first.id().get(),
                            });
                        }
                        (Some(_), IfAlreadyRegistered::Keep) => return Ok(None),
                        (Some(_), IfAlreadyRegistered::Replace) => {
                            factories.retain(|(k, _)| !k.is_default_like());
                            factories.push((ServiceKey::Default, factory));
                        }
                        (Some(_), IfAlreadyRegistered::AppendNewImplementation) => {
                            if defaults.iter().any(|f| same_implementation(f, &factory)) {
                                return Ok(None);
                            }
                            factories.push((ServiceKey::Indexed(entry.next_index), factory));
                            entry.next_index += 1;
                        }
                    }
                } else {
                    match factories.iter().position(|(k, _)| *k == key) {
                        None => factories.push((key, factory)),
                        Some(position) => match policy {
                            IfAlreadyRegistered::Keep => return Ok(None),
                            IfAlreadyRegistered::Replace => factories[position] = (key, factory),
                            IfAlreadyRegistered::AppendNewImplementation
                                if same_implementation(&factories[position].1, &factory) =>
                            {
                                return Ok(None);
                            }
                            _ => {
                                return Err(DiError::DuplicateKey {
                                    service: service.name().to_string(),
                                    key: key.to_string(),
                                });
                            }
                        },
                    }
                }
                entry.factories = Arc::new(factories);
                entry
            }
        };

        let mut services = TypeMap::clone(&self.services);
        services.insert(service.id(), entry);
        Ok(Some(Registry {
            services: Arc::new(services),
            ..self.rebuilt()
        }))
    }

    /// Add a decorator for one service type, or for every type when `service` is `None`
    pub(crate) fn with_decorator(&self, service: Option<&ServiceType>, decorator: FactoryRef) -> Result<Registry> {
        let id = match service {
            Some(service) => {
                self.ensure_unlocked(service)?;
                service.id()
            }
            None => {
                self.ensure_unlocked(&ServiceType::of::<AnyService>())?;
                TypeId::of::<AnyService>()
            }
        };
        let mut decorators = TypeMap::clone(&self.decorators);
        let mut list: Vec<FactoryRef> = decorators.get(&id).map(|l| l.to_vec()).unwrap_or_default();
        list.push(decorator);
        decorators.insert(id, list.into());
        Ok(Registry {
            decorators: Arc::new(decorators),
            ..self.rebuilt()
        })
    }

    /// Set the wrapper for a service type (or open definition)
    pub(crate) fn with_wrapper(&self, service: &ServiceType, wrapper: FactoryRef) -> Result<Registry> {
        self.ensure_unlocked(service)?;
        let mut wrappers = TypeMap::clone(&self.wrappers);
        wrappers.insert(service.id(), wrapper);
        Ok(Registry {
            wrappers: Arc::new(wrappers),
            ..self.rebuilt()
        })
    }

    /// Remember that instances of the type may be supplied through `use_instance`
    pub(crate) fn with_used(&self, service: &ServiceType) -> Option<Registry> {
        if self.used.contains(&service.id()) {
            return None;
        }
        let mut used = HashSet::clone(&self.used);
        used.insert(service.id());
        Some(Registry {
            used: Arc::new(used),
            ..self.rebuilt()
        })
    }

    /// Remove matching registrations; `None` when nothing matched.
    ///
    /// For services, no key removes every registration of the type, the default
    /// key removes all default-like registrations, any other key removes that key.
    pub(crate) fn without<P>(&self, service: &ServiceType, key: Option<&ServiceKey>, kind: FactoryKind, predicate: P) -> Result<Option<Registry>>
    where
        P: Fn(&FactoryRef) -> bool,
    {
        self.ensure_unlocked(service)?;
        match kind {
            FactoryKind::Service => {
                let Some(entry) = self.services.get(&service.id()) else {
                    return Ok(None);
                };
                let matches_key = |k: &ServiceKey| match key {
                    None => true,
                    Some(ServiceKey::Default) => k.is_default_like(),
                    Some(key) => k == key,
                };
                let kept: Vec<(ServiceKey, FactoryRef)> = entry
                    .factories
                    .iter()
                    .filter(|(k, f)| !(matches_key(k) && predicate(f)))
                    .cloned()
                    .collect();
                if kept.len() == entry.factories.len() {
                    return Ok(None);
                }
                let mut services = TypeMap::clone(&self.services);
                if kept.is_empty() {
                    services.remove(&service.id());
                } else {
                    let mut entry = entry.clone();
                    entry.factories = Arc::new(kept);
                    services.insert(service.id(), entry);
                }
                Ok(Some(Registry {
                    services: Arc::new(services),
                    ..self.rebuilt()
                }))
            }
            FactoryKind::Decorator => {
                let Some(list) = self.decorators.get(&service.id()) else {
                    return Ok(None);
                };
                let kept: Vec<FactoryRef> = list.iter().filter(|f| !predicate(f)).cloned().collect();
                if kept.len() == list.len() {
                    return Ok(None);
                }
                let mut decorators = TypeMap::clone(&self.decorators);
                if kept.is_empty() {
                    decorators.remove(&service.id());
                } else {
                    decorators.insert(service.id(), kept.into());
                }
                Ok(Some(Registry {
                    decorators: Arc::new(decorators),
                    ..self.rebuilt()
                }))
            }
            FactoryKind::Wrapper => {
                if !self.wrappers.get(&service.id()).is_some_and(|w| predicate(w)) {
                    return Ok(None);
                }
                let mut wrappers = TypeMap::clone(&self.wrappers);
                wrappers.remove(&service.id());
                Ok(Some(Registry {
                    wrappers: Arc::new(wrappers),
                    ..self.rebuilt()
                }))
            }
        }
    }

    /// The same registrations with changes disallowed (caches are kept)
    pub(crate) fn locked(&self) -> Registry {
        Registry {
            services: Arc::clone(&self.services),
            decorators: Arc::clone(&self.decorators),
            wrappers: Arc::clone(&self.wrappers),
            used: Arc::clone(&self.used),
            locked: true,
            caches: Arc::clone(&self.caches),
        }
    }

    // ===== Resolution caches =====

    /// Cached root plan for a service type and key.
    ///
    /// An unkeyed request and an explicit [`ServiceKey::Default`] request are
    /// cached apart: the first selects among every default-like registration.
    pub(crate) fn cached(&self, service: &ServiceType, key: Option<&ServiceKey>) -> Option<Arc<CacheEntry>> {
        let service = RootKey::of(service);
        match key {
            None => self.caches.default.get(&service),
            Some(key) => self.caches.keyed.get(&service).and_then(|list| list.find(key)),
        }
    }

    /// Cache a root plan; returns the entry that is now in the cache
    pub(crate) fn cache(&self, service: &ServiceType, key: Option<&ServiceKey>, plan: Plan) -> Option<Arc<CacheEntry>> {
        if self.is_empty() || plan.is_missing() {
            return None;
        }
        let root = RootKey::of(service);
        let entry = Arc::new(CacheEntry::new(plan));
        match key {
            None => {
                self.caches.default.update(&root, |existing| match existing {
                    Some(existing) => Arc::clone(existing),
                    None => Arc::clone(&entry),
                });
            }
            Some(key) => {
                self.caches.keyed.update(&root, |list| match list {
                    Some(list) if list.find(key).is_some() => Arc::clone(list),
                    _ => Arc::new(KeyedNode {
                        key: key.clone(),
                        entry: Arc::clone(&entry),
                        next: list.cloned(),
                    }),
                });
            }
        }
        self.cached(service, key)
    }

    /// Cached plan of a factory built in a context-free subtree
    pub(crate) fn cached_expression(&self, id: FactoryId, reuse: &Reuse, tracked: Option<&ReuseTarget>) -> Option<Plan> {
        let entry = self.caches.expressions.get(&id)?;
        (entry.reuse == *reuse && entry.tracked.as_ref() == tracked).then(|| entry.plan.clone())
    }

    pub(crate) fn cache_expression(&self, id: FactoryId, reuse: Reuse, tracked: Option<ReuseTarget>, plan: Plan) {
        if self.is_empty() {
            return;
        }
        let entry = Arc::new(ExpressionEntry { plan, reuse, tracked });
        self.caches.expressions.update(&id, |_| Arc::clone(&entry));
    }
}
