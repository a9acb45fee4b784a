//! Resolution requests
//!
//! A [`Request`] is one node of the chain from the resolution root down to the
//! dependency currently being planned. Nodes are immutable and shared; pushing a
//! dependency or binding a factory creates a new node pointing at its parent.
//!
//! Binding a factory ([`Request::with_resolved_factory`]) is where the graph is
//! validated: recursive dependencies and captive dependencies are rejected, and
//! disposable transients are promoted to tracked instances when the rules ask for
//! it.

use crate::registry::Registry;
use crate::{
    Container, DiError, FactoryId, FactoryKind, FactoryRef, IfUnresolved, Instance, Plan, Result, Reuse, ReuseTarget,
    ServiceInfo, ServiceKey, ServiceType,
};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Bit set describing how a request was reached.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestFlags(u16);

impl RequestFlags {
    pub const EMPTY: Self = Self(0);
    /// The request is a singleton or sits below one
    pub const IS_SINGLETON_OR_DEPENDENCY: Self = Self(1);
    /// The request sits below a deferred (lazy) wrapper
    pub const WRAPPED_IN_DEFERRED: Self = Self(1 << 1);
    /// Recursion checks stop at this node
    pub const STOP_RECURSION_CHECK: Self = Self(1 << 2);
    /// The bound factory opens a resolution scope
    pub const OPENS_RESOLUTION_SCOPE: Self = Self(1 << 3);
    /// The request is the root of an out-of-line resolution call
    pub const IS_RESOLUTION_CALL: Self = Self(1 << 4);

    const INHERITED: Self = Self(Self::IS_SINGLETON_OR_DEPENDENCY.0 | Self::WRAPPED_IN_DEFERRED.0);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    fn inherited(self) -> Self {
        Self(self.0 & Self::INHERITED.0)
    }
}

impl BitOr for RequestFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::IS_SINGLETON_OR_DEPENDENCY, "IS_SINGLETON_OR_DEPENDENCY"),
            (Self::WRAPPED_IN_DEFERRED, "WRAPPED_IN_DEFERRED"),
            (Self::STOP_RECURSION_CHECK, "STOP_RECURSION_CHECK"),
            (Self::OPENS_RESOLUTION_SCOPE, "OPENS_RESOLUTION_SCOPE"),
            (Self::IS_RESOLUTION_CALL, "IS_RESOLUTION_CALL"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "RequestFlags({})", set.join(" | "))
    }
}

/// Marks propagated from a node to all of its ancestors
const CONTEXT_SENSITIVE: u8 = 1;
const UNCACHEABLE: u8 = 1 << 1;

struct ResolvedFactory {
    registration: FactoryRef,
    reuse: Reuse,
    tracked: Option<ReuseTarget>,
}

struct RequestNode {
    parent: Option<Arc<RequestNode>>,
    info: ServiceInfo,
    factory: Option<ResolvedFactory>,
    flags: RequestFlags,
    depth: u32,
    dependencies: AtomicU32,
    marks: AtomicU8,
}

impl RequestNode {
    fn new(parent: Option<Arc<RequestNode>>, info: ServiceInfo, factory: Option<ResolvedFactory>, flags: RequestFlags, depth: u32) -> Self {
        Self {
            parent,
            info,
            factory,
            flags,
            depth,
            dependencies: AtomicU32::new(0),
            marks: AtomicU8::new(0),
        }
    }

    #[inline]
    fn reuse(&self) -> Option<&Reuse> {
        self.factory.as_ref().map(|f| &f.reuse)
    }

    #[inline]
    fn factory_id(&self) -> Option<FactoryId> {
        self.factory.as_ref().map(|f| f.registration.id())
    }
}

struct RequestContext {
    container: Container,
    registry: Arc<Registry>,
    args: Vec<Instance>,
    seed: Option<Instance>,
}

/// A node in the chain of requests currently being planned.
#[derive(Clone)]
pub struct Request {
    node: Arc<RequestNode>,
    context: Arc<RequestContext>,
}

impl Request {
    /// The empty root of a resolution against `container`
    pub(crate) fn root(container: &Container, args: Vec<Instance>) -> Self {
        Self::root_in(container, container.registry(), args)
    }

    /// The empty root of a resolution against a pinned registry snapshot
    pub(crate) fn root_in(container: &Container, registry: Arc<Registry>, args: Vec<Instance>) -> Self {
        Self {
            node: Arc::new(RequestNode::new(None, ServiceInfo::of::<()>(), None, RequestFlags::EMPTY, 0)),
            context: Arc::new(RequestContext {
                container: container.clone(),
                registry,
                args,
                seed: None,
            }),
        }
    }

    /// A root whose requests for the seed's type are served by `seed` once
    /// the decorators registered for that type are used up
    pub(crate) fn seeded(container: &Container, registry: Arc<Registry>, seed: Instance) -> Self {
        Self {
            node: Arc::new(RequestNode::new(None, ServiceInfo::of::<()>(), None, RequestFlags::EMPTY, 0)),
            context: Arc::new(RequestContext {
                container: container.clone(),
                registry,
                args: Vec::new(),
                seed: Some(seed),
            }),
        }
    }

    #[inline]
    fn with_node(&self, node: RequestNode) -> Self {
        Self {
            node: Arc::new(node),
            context: Arc::clone(&self.context),
        }
    }

    /// Whether this is the empty root
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node.depth == 0
    }

    /// The parent request (`None` for the empty root)
    pub fn parent(&self) -> Option<Request> {
        self.node.parent.as_ref().map(|parent| Self {
            node: Arc::clone(parent),
            context: Arc::clone(&self.context),
        })
    }

    /// Whether the parent is the empty root
    #[inline]
    pub fn is_resolution_root(&self) -> bool {
        self.node.depth == 1
    }

    /// Ancestors from the parent up to (excluding) the empty root
    pub fn ancestors(&self) -> impl Iterator<Item = Request> + '_ {
        std::iter::successors(self.parent(), Request::parent).filter(|request| !request.is_empty())
    }

    fn ancestor_nodes(&self) -> impl Iterator<Item = &RequestNode> {
        std::iter::successors(self.node.parent.as_deref(), |node| node.parent.as_deref()).filter(|node| node.depth > 0)
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.node.depth
    }

    #[inline]
    pub fn flags(&self) -> RequestFlags {
        self.node.flags
    }

    #[inline]
    pub fn info(&self) -> &ServiceInfo {
        &self.node.info
    }

    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        self.node.info.service_type()
    }

    #[inline]
    pub fn key(&self) -> Option<&ServiceKey> {
        self.node.info.key()
    }

    #[inline]
    pub fn required_type(&self) -> Option<&ServiceType> {
        self.node.info.required_type()
    }

    #[inline]
    pub fn if_unresolved(&self) -> IfUnresolved {
        self.node.info.unresolved_policy()
    }

    /// The factory bound to this request, if any
    #[inline]
    pub fn factory(&self) -> Option<&FactoryRef> {
        self.node.factory.as_ref().map(|f| &f.registration)
    }

    #[inline]
    pub fn factory_id(&self) -> Option<FactoryId> {
        self.node.factory_id()
    }

    #[inline]
    pub fn factory_kind(&self) -> Option<FactoryKind> {
        self.factory().map(|f| f.kind())
    }

    /// Effective reuse of the bound factory
    #[inline]
    pub fn reuse(&self) -> Option<&Reuse> {
        self.node.reuse()
    }

    /// Where a promoted disposable transient is tracked
    #[inline]
    pub(crate) fn tracked_target(&self) -> Option<&ReuseTarget> {
        self.node.factory.as_ref().and_then(|f| f.tracked.as_ref())
    }

    /// The container the request is resolved against
    #[inline]
    pub fn container(&self) -> &Container {
        &self.context.container
    }

    /// The registry snapshot the resolution plans against
    #[inline]
    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.context.registry
    }

    /// Number of dependencies planned below this request so far
    #[inline]
    pub fn dependency_count(&self) -> u32 {
        self.node.dependencies.load(Ordering::Relaxed)
    }

    /// Whether per-call arguments were passed to the resolution
    #[inline]
    pub(crate) fn has_args(&self) -> bool {
        !self.context.args.is_empty()
    }

    /// Per-call argument assignable to the service type
    pub(crate) fn arg_for(&self, service: &ServiceType) -> Option<Instance> {
        self.context
            .args
            .iter()
            .find(|arg| (***arg).type_id() == service.id())
            .map(Arc::clone)
    }

    /// The seed instance, when it has the requested service type
    pub(crate) fn seed_for(&self, service: &ServiceType) -> Option<Instance> {
        self.context
            .seed
            .as_ref()
            .filter(|seed| (***seed).type_id() == service.id())
            .map(Arc::clone)
    }

    #[inline]
    pub(crate) fn is_seeded(&self) -> bool {
        self.context.seed.is_some()
    }

    // ===== Marks =====

    // Marks reach the empty root too; the root cache reads them there.
    fn mark(&self, mark: u8) {
        let mut node = Some(&*self.node);
        while let Some(current) = node {
            current.marks.fetch_or(mark, Ordering::Relaxed);
            node = current.parent.as_deref();
        }
    }

    /// Record that the plan depends on the request context (conditions,
    /// decorators, selectors); such plans never enter the per-factory cache.
    #[inline]
    pub(crate) fn mark_context_sensitive(&self) {
        self.mark(CONTEXT_SENSITIVE);
    }

    /// Record that no cache may hold the plan
    #[inline]
    pub(crate) fn mark_uncacheable(&self) {
        self.mark(UNCACHEABLE);
    }

    #[inline]
    pub(crate) fn is_context_sensitive(&self) -> bool {
        self.node.marks.load(Ordering::Relaxed) & CONTEXT_SENSITIVE != 0
    }

    #[inline]
    pub(crate) fn is_uncacheable(&self) -> bool {
        self.node.marks.load(Ordering::Relaxed) & UNCACHEABLE != 0
    }

    /// Whether every bound ancestor is transient and no exemption flag is active
    pub(crate) fn is_in_transient_context(&self) -> bool {
        !self.flags().contains(RequestFlags::WRAPPED_IN_DEFERRED)
            && self.ancestor_nodes().all(|node| {
                node.reuse().is_none_or(Reuse::is_transient)
                    && !node.flags.contains(RequestFlags::OPENS_RESOLUTION_SCOPE)
                    && node.factory.as_ref().is_none_or(|f| f.tracked.is_none())
            })
    }

    // ===== Chain building =====

    /// Push a dependency request below this one
    #[inline]
    pub fn push(&self, info: ServiceInfo) -> Request {
        self.push_with(info, RequestFlags::EMPTY)
    }

    /// Push a dependency request with extra flags
    pub fn push_with(&self, info: ServiceInfo, flags: RequestFlags) -> Request {
        self.with_node(RequestNode::new(
            Some(Arc::clone(&self.node)),
            info,
            None,
            self.node.flags.inherited() | flags,
            self.node.depth + 1,
        ))
    }

    /// Plan a dependency of this request
    pub fn dependency(&self, info: ServiceInfo) -> Result<Plan> {
        self.container().plan_for(&self.push(info))
    }

    /// Plan a dependency that is resolved lazily through a [`crate::Thunk`]
    pub fn deferred(&self, info: ServiceInfo) -> Result<Plan> {
        let child = self.push_with(info, RequestFlags::WRAPPED_IN_DEFERRED | RequestFlags::STOP_RECURSION_CHECK);
        self.container().plan_deferred(&child)
    }

    /// Whether `id` is bound anywhere above this request, ignoring recursion stops
    pub(crate) fn has_ancestor_factory(&self, id: FactoryId) -> bool {
        self.ancestor_nodes().any(|node| node.factory_id() == Some(id))
    }

    /// Bind a factory to this request, validating the dependency graph.
    pub fn with_resolved_factory(&self, factory: FactoryRef) -> Result<Request> {
        let rules = self.container().rules();
        let reuse = match (factory.reuse(), factory.kind()) {
            (Some(reuse), _) => reuse.clone(),
            (None, FactoryKind::Wrapper) => Reuse::Transient,
            (None, _) => rules.default_reuse().clone(),
        };

        self.check_recursion(&factory)?;

        let disposable = factory.setup().is_disposable();
        let untracked_disposable_transient = reuse.is_transient() && disposable && !rules.tracks_disposable_transients();
        if rules.checks_captive_dependencies()
            && !self.flags().contains(RequestFlags::WRAPPED_IN_DEFERRED)
            && (!reuse.is_transient() || untracked_disposable_transient)
        {
            self.check_captive(&reuse, untracked_disposable_transient)?;
        }

        let tracked = (reuse.is_transient() && disposable && rules.tracks_disposable_transients()).then(|| self.tracking_target());

        let mut flags = self.node.flags;
        if reuse == Reuse::Singleton {
            flags = flags | RequestFlags::IS_SINGLETON_OR_DEPENDENCY;
        }
        if factory.setup().opens_resolution_scope() {
            flags = flags | RequestFlags::OPENS_RESOLUTION_SCOPE;
        }

        for node in self.ancestor_nodes() {
            node.dependencies.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_injector",
            service = self.service_type().name(),
            factory_id = factory.id().get(),
            reuse = %reuse,
            depth = self.node.depth,
            "Bound factory to request"
        );

        Ok(self.with_node(RequestNode::new(
            self.node.parent.clone(),
            self.node.info.clone(),
            Some(ResolvedFactory {
                registration: factory,
                reuse,
                tracked,
            }),
            flags,
            self.node.depth,
        )))
    }

    fn check_recursion(&self, factory: &FactoryRef) -> Result<()> {
        if self.flags().contains(RequestFlags::STOP_RECURSION_CHECK) {
            return Ok(());
        }
        let mut node = self.node.parent.as_deref();
        while let Some(current) = node {
            if current.factory_id() == Some(factory.id()) {
                let chain = self.describe_chain();

                #[cfg(feature = "logging")]
                debug!(
                    target: "scoped_injector",
                    service = self.service_type().name(),
                    chain = %chain,
                    "Recursive dependency detected"
                );

                return Err(DiError::recursive(self.service_type().name(), chain));
            }
            if current.flags.contains(RequestFlags::STOP_RECURSION_CHECK) {
                break;
            }
            node = current.parent.as_deref();
        }
        Ok(())
    }

    fn check_captive(&self, reuse: &Reuse, untracked_disposable: bool) -> Result<()> {
        for node in self.ancestor_nodes() {
            if node.flags.contains(RequestFlags::OPENS_RESOLUTION_SCOPE) {
                break;
            }
            let Some(owner_reuse) = node.reuse() else {
                continue;
            };
            if owner_reuse.lifespan() > reuse.lifespan() {
                let dependency_reuse = if untracked_disposable {
                    format!("{reuse}, disposable and untracked")
                } else {
                    reuse.to_string()
                };
                return Err(DiError::CaptiveDependency {
                    dependency: self.service_type().name().to_string(),
                    dependency_reuse,
                    owner: node.info.service_type().name().to_string(),
                    owner_reuse: owner_reuse.to_string(),
                });
            }
        }
        Ok(())
    }

    fn tracking_target(&self) -> ReuseTarget {
        for node in self.ancestor_nodes() {
            if node.flags.contains(RequestFlags::OPENS_RESOLUTION_SCOPE) {
                break;
            }
            if let Some(target) = node.reuse().and_then(Reuse::target) {
                return target;
            }
        }
        ReuseTarget::CurrentOrSingleton
    }

    /// Root-to-current chain of service names
    fn describe_chain(&self) -> String {
        let mut names: Vec<&str> = self.ancestor_nodes().map(|node| node.info.service_type().name()).collect();
        names.reverse();
        names.push(self.service_type().name());
        names.join(" -> ")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Request(empty)");
        }
        f.debug_struct("Request")
            .field("info", &self.node.info)
            .field("factory_id", &self.factory_id())
            .field("reuse", &self.reuse())
            .field("flags", &self.node.flags)
            .field("depth", &self.node.depth)
            .finish()
    }
}
