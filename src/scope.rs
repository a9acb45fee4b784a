//! Scopes: lifetime-bound storage for reused instances
//!
//! A [`Scope`] stores instances keyed by an integer slot id and remembers which
//! of them need disposal. Creation of a slot's value happens exactly once even
//! when many threads race for it: the thread that publishes the reserved slot
//! runs the factory, everybody else waits (bounded by a timeout) for its result.

use crate::{Container, DiError, Instance, Result, ServiceType};
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::TypeId;
use std::fmt;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

/// Number of shards for slot storage
const SLOT_SHARDS: usize = 16;

/// Type-erased disposer called with the stored instance.
pub type Disposer = Arc<dyn Fn(&Instance) -> Result<()> + Send + Sync>;

/// How an instance is torn down when its scope is disposed.
#[derive(Clone)]
pub struct Disposal {
    disposer: Disposer,
    order: Option<i32>,
}

impl Disposal {
    /// Dispose in reverse registration order (after all ordered disposals)
    #[inline]
    pub fn new(disposer: Disposer) -> Self {
        Self { disposer, order: None }
    }

    /// Dispose ascending by `order`, before unordered disposals
    #[inline]
    pub fn ordered(disposer: Disposer, order: i32) -> Self {
        Self {
            disposer,
            order: Some(order),
        }
    }

    #[inline]
    pub fn order(&self) -> Option<i32> {
        self.order
    }

    #[inline]
    pub(crate) fn run(&self, instance: &Instance) -> Result<()> {
        (self.disposer)(instance)
    }
}

impl fmt::Debug for Disposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposal").field("order", &self.order).finish()
    }
}

// =============================================================================
// Slots
// =============================================================================

enum Waited {
    Ready(Instance),
    Failed,
    TimedOut,
}

/// A reserved-then-set cell for one reused instance
struct ScopeSlot {
    value: OnceCell<Instance>,
    failed: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl ScopeSlot {
    fn new() -> Self {
        Self {
            value: OnceCell::new(),
            failed: AtomicBool::new(false),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    #[inline]
    fn get(&self) -> Option<Instance> {
        self.value.get().cloned()
    }

    fn publish(&self, instance: Instance) {
        let _ = self.value.set(instance);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Waited {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if let Some(instance) = self.get() {
                return Waited::Ready(instance);
            }
            if self.failed.load(Ordering::Acquire) {
                return Waited::Failed;
            }
            if self.ready.wait_until(&mut guard, deadline).timed_out() {
                return match self.get() {
                    Some(instance) => Waited::Ready(instance),
                    None if self.failed.load(Ordering::Acquire) => Waited::Failed,
                    None => Waited::TimedOut,
                };
            }
        }
    }
}

/// Releases a reserved slot when its creator fails or unwinds
struct ReservedSlot<'a> {
    scope: &'a Scope,
    id: u64,
    slot: Arc<ScopeSlot>,
    filled: bool,
}

impl Drop for ReservedSlot<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.scope
                .slots
                .remove_if(&self.id, |_, slot| Arc::ptr_eq(slot, &self.slot));
            self.slot.fail();
        }
    }
}

struct PendingDisposal {
    service: &'static str,
    instance: Instance,
    disposal: Disposal,
    sequence: u64,
}

// =============================================================================
// Scope
// =============================================================================

/// Storage for reused instances plus their disposal tracking.
///
/// Scopes form a chain through their parent; disposing a scope disposes its
/// still-alive children first.
pub struct Scope {
    id: u64,
    name: Option<Arc<str>>,
    parent: Option<Arc<Scope>>,
    slots: DashMap<u64, Arc<ScopeSlot>, RandomState>,
    used: RwLock<Vec<(TypeId, Instance)>>,
    ordered: Mutex<Vec<PendingDisposal>>,
    unordered: Mutex<Vec<PendingDisposal>>,
    children: Mutex<Vec<Weak<Scope>>>,
    sequence: AtomicU64,
    disposed: AtomicBool,
    wait_timeout: Duration,
}

impl Scope {
    /// Create a scope, registering it as a child of `parent`.
    pub fn new(parent: Option<Arc<Scope>>, name: Option<Arc<str>>, wait_timeout: Duration) -> Arc<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            scope_id = id,
            name = name.as_deref().unwrap_or(""),
            parent_scope_id = parent.as_ref().map(|p| p.id),
            "Opening scope"
        );

        let scope = Arc::new(Self {
            id,
            name,
            parent,
            slots: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), SLOT_SHARDS),
            used: RwLock::new(Vec::new()),
            ordered: Mutex::new(Vec::new()),
            unordered: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            wait_timeout,
        });

        if let Some(parent) = &scope.parent {
            let mut children = parent.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&scope));
        }

        scope
    }

    /// Unique scope id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Optional scope name
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Parent scope, if any
    #[inline]
    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of stored instances
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Find this scope or its nearest ancestor with the given name
    pub fn find_named(self: &Arc<Self>, name: &str) -> Option<Arc<Scope>> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if scope.name() == Some(name) {
                return Some(Arc::clone(scope));
            }
            current = scope.parent.as_ref();
        }
        None
    }

    #[inline]
    fn ensure_alive(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(DiError::scope_disposed(self));
        }
        Ok(())
    }

    /// The stored instance for `id`, if it was already created
    pub fn get(&self, id: u64) -> Option<Instance> {
        self.slots.get(&id).and_then(|slot| slot.get())
    }

    /// Return the instance stored under `id`, creating it exactly once.
    ///
    /// Concurrent callers for the same id wait for the creating caller up to the
    /// scope's timeout and then fail with [`DiError::WaitTimeout`]. If creation
    /// fails, the slot is released and waiting callers race again.
    pub fn get_or_add<F>(&self, id: u64, service: &ServiceType, create: F, disposal: Option<&Disposal>) -> Result<Instance>
    where
        F: FnOnce() -> Result<Instance>,
    {
        self.ensure_alive()?;

        let slot = loop {
            let existing = self.slots.get(&id).map(|slot| Arc::clone(slot.value()));
            let (slot, owner) = match existing {
                Some(slot) => (slot, false),
                None => {
                    let fresh = Arc::new(ScopeSlot::new());
                    let published = Arc::clone(self.slots.entry(id).or_insert_with(|| Arc::clone(&fresh)).value());
                    let owner = Arc::ptr_eq(&published, &fresh);
                    (published, owner)
                }
            };

            if let Some(instance) = slot.get() {
                #[cfg(feature = "logging")]
                trace!(
                    target: "scoped_injector",
                    service = service.name(),
                    scope_id = self.id,
                    slot = id,
                    "Reused instance found in scope"
                );
                return Ok(instance);
            }
            if owner {
                break slot;
            }

            #[cfg(feature = "logging")]
            trace!(
                target: "scoped_injector",
                service = service.name(),
                scope_id = self.id,
                slot = id,
                "Waiting for concurrent creation"
            );

            match slot.wait(self.wait_timeout) {
                Waited::Ready(instance) => return Ok(instance),
                Waited::Failed => continue,
                Waited::TimedOut => {
                    return Err(DiError::WaitTimeout {
                        service: service.name().to_string(),
                        waited_ms: u64::try_from(self.wait_timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
        };

        let mut reserved = ReservedSlot {
            scope: self,
            id,
            slot,
            filled: false,
        };
        let instance = create()?;

        if self.is_disposed() {
            // The scope went away while the instance was being built
            if let Some(disposal) = disposal {
                dispose_now(service, instance, disposal);
            }
            return Err(DiError::scope_disposed(self));
        }

        reserved.slot.publish(Arc::clone(&instance));
        reserved.filled = true;

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_injector",
            service = service.name(),
            scope_id = self.id,
            slot = id,
            "Stored new instance in scope"
        );

        if let Some(disposal) = disposal {
            self.push_disposal(service, Arc::clone(&instance), disposal)?;
        }
        Ok(instance)
    }

    /// Track a non-reused instance for disposal together with this scope.
    ///
    /// On a disposed scope the instance is disposed right away and
    /// [`DiError::ScopeDisposed`] is returned.
    pub fn track(&self, service: &ServiceType, instance: Instance, disposal: &Disposal) -> Result<()> {
        self.push_disposal(service, instance, disposal)
    }

    fn push_disposal(&self, service: &ServiceType, instance: Instance, disposal: &Disposal) -> Result<()> {
        let mut list = match disposal.order {
            Some(_) => self.ordered.lock(),
            None => self.unordered.lock(),
        };
        // `dispose` raises the flag before draining this list under the same lock
        if self.is_disposed() {
            drop(list);
            dispose_now(service, instance, disposal);
            return Err(DiError::scope_disposed(self));
        }
        list.push(PendingDisposal {
            service: service.name(),
            instance,
            disposal: disposal.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        });
        Ok(())
    }

    /// Store a ready-made instance for a service type in this scope.
    pub fn use_instance(&self, service: &ServiceType, instance: Instance) -> Result<()> {
        self.ensure_alive()?;
        let mut used = self.used.write();
        match used.iter_mut().find(|(id, _)| *id == service.id()) {
            Some(entry) => entry.1 = instance,
            None => used.push((service.id(), instance)),
        }
        Ok(())
    }

    /// Instance stored with [`Scope::use_instance`] in this scope or its parents
    pub fn used_instance(&self, service: &ServiceType) -> Option<Instance> {
        let mut current = Some(self);
        while let Some(scope) = current {
            let found = scope
                .used
                .read()
                .iter()
                .find(|(id, _)| *id == service.id())
                .map(|(_, instance)| Arc::clone(instance));
            if found.is_some() {
                return found;
            }
            current = scope.parent.as_deref();
        }
        None
    }

    /// Dispose the scope. Only the first call does any work.
    ///
    /// Child scopes are disposed first, then ordered disposals ascending by order,
    /// then unordered disposals in reverse registration order. Failures reported
    /// by disposers (and panics) are logged and skipped; the first structural
    /// error is returned after every disposer ran.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            scope_id = self.id,
            name = self.name().unwrap_or(""),
            instances = self.slots.len(),
            "Disposing scope"
        );

        let mut first_error = None;

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().rev().filter_map(Weak::upgrade) {
            if let Err(err) = child.dispose() {
                first_error.get_or_insert(err);
            }
        }

        let mut ordered = std::mem::take(&mut *self.ordered.lock());
        ordered.sort_by_key(|pending| (pending.disposal.order.unwrap_or_default(), pending.sequence));
        for pending in ordered {
            run_disposal(&pending, &mut first_error);
        }

        let unordered = std::mem::take(&mut *self.unordered.lock());
        for pending in unordered.into_iter().rev() {
            run_disposal(&pending, &mut first_error);
        }

        self.slots.clear();
        self.used.write().clear();

        first_error.map_or(Ok(()), Err)
    }
}

/// Dispose an instance that arrived after its scope was torn down
fn dispose_now(service: &ServiceType, instance: Instance, disposal: &Disposal) {
    let pending = PendingDisposal {
        service: service.name(),
        instance,
        disposal: disposal.clone(),
        sequence: 0,
    };
    let mut structural = None;
    run_disposal(&pending, &mut structural);
    if let Some(_err) = structural {
        #[cfg(feature = "logging")]
        warn!(
            target: "scoped_injector",
            service = pending.service,
            error = %_err,
            "Disposal after scope teardown failed"
        );
    }
}

fn run_disposal(pending: &PendingDisposal, first_error: &mut Option<DiError>) {
    match catch_unwind(AssertUnwindSafe(|| pending.disposal.run(&pending.instance))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_structural() => {
            first_error.get_or_insert(err);
        }
        Ok(Err(_err)) => {
            #[cfg(feature = "logging")]
            warn!(
                target: "scoped_injector",
                service = pending.service,
                error = %_err,
                "Disposer failed, continuing teardown"
            );
        }
        Err(_) => {
            #[cfg(feature = "logging")]
            warn!(
                target: "scoped_injector",
                service = pending.service,
                "Disposer panicked, continuing teardown"
            );
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "scope-{}({})", self.id, name),
            None => write!(f, "scope-{}", self.id),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instances", &self.slots.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// =============================================================================
// Current scope providers
// =============================================================================

/// Source of the ambient "current scope".
///
/// Containers without a provider only see scopes bound explicitly through a
/// [`ScopedContainer`].
pub trait ScopeContext: Send + Sync {
    /// The current scope of the calling context
    fn current(&self) -> Option<Arc<Scope>>;

    /// Replace the current scope, returning the previous one
    fn set_current(&self, scope: Option<Arc<Scope>>) -> Option<Arc<Scope>>;
}

thread_local! {
    static THREAD_SCOPES: std::cell::RefCell<Vec<(u64, Arc<Scope>)>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Keeps the current scope per thread.
#[derive(Debug)]
pub struct ThreadLocalScopeContext {
    id: u64,
}

impl ThreadLocalScopeContext {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for ThreadLocalScopeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeContext for ThreadLocalScopeContext {
    fn current(&self) -> Option<Arc<Scope>> {
        THREAD_SCOPES.with(|scopes| {
            scopes
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|(_, scope)| Arc::clone(scope))
        })
    }

    fn set_current(&self, scope: Option<Arc<Scope>>) -> Option<Arc<Scope>> {
        THREAD_SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let position = scopes.iter().position(|(id, _)| *id == self.id);
            let previous = position.map(|index| scopes.swap_remove(index).1);
            if let Some(scope) = scope {
                scopes.push((self.id, scope));
            }
            previous
        })
    }
}

// =============================================================================
// ScopedContainer
// =============================================================================

/// A container view bound to a freshly opened scope.
///
/// Scoped services resolved through it live in its scope. The scope is disposed
/// when the guard is dropped (or explicitly through [`ScopedContainer::dispose`]),
/// and the previous ambient scope is restored.
///
/// # Examples
///
/// ```rust
/// use scoped_injector::{Container, Reuse};
/// use std::sync::Arc;
///
/// struct RequestContext {
///     id: u64,
/// }
///
/// let container = Container::new();
/// container.scoped(|| RequestContext { id: 7 }).unwrap();
///
/// let scope = container.open_scope(None).unwrap();
/// let a = scope.get::<RequestContext>().unwrap();
/// let b = scope.get::<RequestContext>().unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// assert_eq!(a.id, 7);
/// ```
pub struct ScopedContainer {
    container: Container,
    scope: Arc<Scope>,
    previous: Option<Option<Arc<Scope>>>,
    released: bool,
}

impl ScopedContainer {
    pub(crate) fn new(container: Container, scope: Arc<Scope>, previous: Option<Option<Arc<Scope>>>) -> Self {
        Self {
            container,
            scope,
            previous,
            released: false,
        }
    }

    /// The scope owned by this guard
    #[inline]
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// The container view bound to this scope
    #[inline]
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Dispose the scope now and report structural disposal errors.
    pub fn dispose(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let (Some(previous), Some(context)) = (self.previous.take(), self.container.scope_context()) {
            context.set_current(previous);
        }
        self.scope.dispose()
    }
}

impl Deref for ScopedContainer {
    type Target = Container;

    fn deref(&self) -> &Container {
        &self.container
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        if let Err(_err) = self.release() {
            #[cfg(feature = "logging")]
            warn!(
                target: "scoped_injector",
                scope_id = self.scope.id(),
                error = %_err,
                "Scope disposal reported an error on drop"
            );
        }
    }
}

impl fmt::Debug for ScopedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedContainer").field("scope", &self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    fn root() -> Arc<Scope> {
        Scope::new(None, None, Duration::from_secs(5))
    }

    fn recording_disposal(log: &Arc<Mutex<Vec<String>>>, order: Option<i32>) -> Disposal {
        let log = Arc::clone(log);
        let disposer: Disposer = Arc::new(move |instance: &Instance| {
            let name = instance.downcast_ref::<String>().cloned().unwrap_or_default();
            log.lock().push(name);
            Ok(())
        });
        match order {
            Some(order) => Disposal::ordered(disposer, order),
            None => Disposal::new(disposer),
        }
    }

    #[test]
    fn test_get_or_add_creates_once() {
        let scope = root();
        let service = ServiceType::of::<u32>();
        let calls = AtomicU32::new(0);

        let create = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(42u32) as Instance)
        };
        let a = scope.get_or_add(1, &service, create, None).unwrap();
        let b = scope
            .get_or_add(1, &service, || Ok(Arc::new(0u32) as Instance), None)
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_concurrent_get_or_add_single_creation() {
        let scope = root();
        let calls = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let scope = Arc::clone(&scope);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    scope
                        .get_or_add(
                            7,
                            &ServiceType::of::<String>(),
                            || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(20));
                                Ok(Arc::new(String::from("shared")) as Instance)
                            },
                            None,
                        )
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Instance> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn test_wait_timeout_is_an_error() {
        let scope = Scope::new(None, None, Duration::from_millis(30));
        let started = Arc::new(Barrier::new(2));

        let creator = {
            let scope = Arc::clone(&scope);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                scope.get_or_add(
                    1,
                    &ServiceType::of::<u8>(),
                    || {
                        started.wait();
                        thread::sleep(Duration::from_millis(300));
                        Ok(Arc::new(1u8) as Instance)
                    },
                    None,
                )
            })
        };

        started.wait();
        let err = scope
            .get_or_add(1, &ServiceType::of::<u8>(), || Ok(Arc::new(2u8) as Instance), None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WaitTimeout);
        assert!(matches!(err, DiError::WaitTimeout { waited_ms: 30, .. }));
        assert!(creator.join().unwrap().is_ok());
    }

    #[test]
    fn test_failed_creation_releases_slot() {
        let scope = root();
        let service = ServiceType::of::<u8>();

        let err = scope
            .get_or_add(3, &service, || Err(DiError::creation_failed::<u8>("nope")), None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CreationFailed);
        assert!(scope.get(3).is_none());

        let value = scope
            .get_or_add(3, &service, || Ok(Arc::new(9u8) as Instance), None)
            .unwrap();
        assert_eq!(value.downcast_ref::<u8>(), Some(&9));
    }

    #[test]
    fn test_disposal_order() {
        let scope = root();
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = ServiceType::of::<String>();

        for (slot, (name, order)) in [
            ("u1", None),
            ("o3", Some(3)),
            ("o1", Some(1)),
            ("u2", None),
            ("o2", Some(2)),
        ]
        .into_iter()
        .enumerate()
        {
            let disposal = recording_disposal(&log, order);
            scope
                .get_or_add(
                    slot as u64,
                    &service,
                    || Ok(Arc::new(name.to_string()) as Instance),
                    Some(&disposal),
                )
                .unwrap();
        }

        scope.dispose().unwrap();
        assert_eq!(*log.lock(), vec!["o1", "o2", "o3", "u2", "u1"]);
        assert!(scope.is_empty());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let scope = root();
        let log = Arc::new(Mutex::new(Vec::new()));
        let disposal = recording_disposal(&log, None);
        scope
            .track(&ServiceType::of::<String>(), Arc::new(String::from("t")), &disposal)
            .unwrap();

        scope.dispose().unwrap();
        scope.dispose().unwrap();
        assert_eq!(log.lock().len(), 1);

        let err = scope
            .get_or_add(1, &ServiceType::of::<u8>(), || Ok(Arc::new(1u8) as Instance), None)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ScopeDisposed);
    }

    #[test]
    fn test_user_failures_are_swallowed_structural_propagate() {
        let scope = root();
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = ServiceType::of::<String>();

        let failing = Disposal::new(Arc::new(|_: &Instance| Err(DiError::disposer_failed::<String>("io"))));
        let panicking = Disposal::new(Arc::new(|_: &Instance| panic!("disposer panic")));
        let structural = Disposal::new(Arc::new(|_: &Instance| Err(DiError::ContainerDisposed)));

        scope.track(&service, Arc::new(String::from("a")), &recording_disposal(&log, None)).unwrap();
        scope.track(&service, Arc::new(String::from("b")), &structural).unwrap();
        scope.track(&service, Arc::new(String::from("c")), &failing).unwrap();
        scope.track(&service, Arc::new(String::from("d")), &panicking).unwrap();

        let err = scope.dispose().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContainerDisposed);
        // Remaining disposers still ran
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_dispose_disposes_children_only_downwards() {
        let parent = root();
        let child = Scope::new(Some(Arc::clone(&parent)), Some("child".into()), Duration::from_secs(1));
        let sibling = Scope::new(Some(Arc::clone(&parent)), None, Duration::from_secs(1));

        child.dispose().unwrap();
        assert!(child.is_disposed());
        assert!(!parent.is_disposed());
        assert!(!sibling.is_disposed());

        parent.dispose().unwrap();
        assert!(sibling.is_disposed());
    }

    #[test]
    fn test_used_instances_are_inherited() {
        let parent = root();
        let child = Scope::new(Some(Arc::clone(&parent)), None, Duration::from_secs(1));
        let service = ServiceType::of::<u16>();

        parent.use_instance(&service, Arc::new(5u16)).unwrap();
        let found = child.used_instance(&service).unwrap();
        assert_eq!(found.downcast_ref::<u16>(), Some(&5));

        child.use_instance(&service, Arc::new(6u16)).unwrap();
        assert_eq!(child.used_instance(&service).unwrap().downcast_ref::<u16>(), Some(&6));
        assert_eq!(parent.used_instance(&service).unwrap().downcast_ref::<u16>(), Some(&5));
    }

    #[test]
    fn test_thread_local_context() {
        let context = ThreadLocalScopeContext::new();
        assert!(context.current().is_none());

        let scope = root();
        assert!(context.set_current(Some(Arc::clone(&scope))).is_none());
        assert!(Arc::ptr_eq(&context.current().unwrap(), &scope));

        let other = ThreadLocalScopeContext::new();
        assert!(other.current().is_none());

        let previous = context.set_current(None).unwrap();
        assert!(Arc::ptr_eq(&previous, &scope));
        assert!(context.current().is_none());
    }

    #[test]
    fn test_scope_display() {
        let scope = Scope::new(None, Some("request".into()), Duration::from_secs(1));
        let display = format!("{}", scope);
        assert!(display.starts_with("scope-"));
        assert!(display.ends_with("(request)"));
    }

    #[test]
    fn test_track_on_disposed_scope_disposes_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = root();
        scope.dispose().unwrap();

        let err = scope
            .track(
                &ServiceType::of::<String>(),
                Arc::new(String::from("late")),
                &recording_disposal(&log, None),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ScopeDisposed);
        assert_eq!(*log.lock(), vec!["late".to_string()]);
    }

    #[test]
    fn test_tracking_racing_dispose_disposes_each_instance_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        for _ in 0..20 {
            let scope = root();
            let disposed = Arc::new(AtomicU32::new(0));
            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let handles: Vec<_> = (0..THREADS)
                .map(|thread_index| {
                    let scope = Arc::clone(&scope);
                    let disposed = Arc::clone(&disposed);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let disposer: Disposer = Arc::new(move |_: &Instance| {
                            disposed.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                        let disposal = match thread_index % 2 {
                            0 => Disposal::new(disposer),
                            _ => Disposal::ordered(disposer, 1),
                        };
                        barrier.wait();
                        for i in 0..PER_THREAD {
                            let _ = scope.track(&ServiceType::of::<usize>(), Arc::new(i), &disposal);
                        }
                    })
                })
                .collect();

            barrier.wait();
            scope.dispose().unwrap();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(disposed.load(Ordering::SeqCst) as usize, THREADS * PER_THREAD);
        }
    }
}
