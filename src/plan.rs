//! Construction plans
//!
//! A [`Plan`] is the tree of operations that produces one service instance. Plans
//! are built once per request shape and interpreted right away; the registry
//! caches them and the first cache hit compiles the plan into a closure tree.

use crate::{
    Caster, Container, DiError, Disposal, FactoryId, FactoryRef, Injectable, Instance, InvokeFn, Result, ReuseTarget,
    Scope, ServiceInfo, ServiceType, WeakContainer, downcast_instance,
};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{trace, warn};

/// A plan compiled into a closure tree
pub(crate) type CompiledPlan = Arc<dyn Fn(&Container) -> Result<Option<Instance>> + Send + Sync>;

/// Operations producing a service instance.
#[derive(Clone)]
pub enum Plan {
    /// A ready instance
    Constant(Instance),
    /// Call a creation function with the results of the argument plans
    Invoke {
        service: ServiceType,
        args: Vec<Plan>,
        call: InvokeFn,
    },
    /// Get-or-create the inner result in the scope selected by `target`
    Reused {
        service: ServiceType,
        target: ReuseTarget,
        slot: u64,
        disposal: Option<Disposal>,
        inner: Box<Plan>,
    },
    /// Create a new instance every time and track it for disposal
    Tracked {
        service: ServiceType,
        target: ReuseTarget,
        disposal: Disposal,
        inner: Box<Plan>,
    },
    /// Run the inner plan inside a freshly opened scope
    ResolutionScope { service: ServiceType, inner: Box<Plan> },
    /// Build and run a separate plan at execution time
    ResolutionCall(Arc<ResolutionCall>),
    /// Produce a [`Thunk`] that resolves the service when asked
    Deferred {
        info: ServiceInfo,
        inline: Option<Arc<Plan>>,
    },
    /// An instance supplied through `use_instance`, else the fallback plan
    Used {
        service: ServiceType,
        fallback: Option<Box<Plan>>,
    },
    /// Convert the inner instance to another service type
    Convert {
        service: ServiceType,
        cast: Caster,
        inner: Box<Plan>,
    },
    /// Nothing (an optional dependency that did not resolve)
    Missing,
}

impl Plan {
    /// Call `call` with the results of `args`
    #[inline]
    pub fn invoke(service: ServiceType, args: Vec<Plan>, call: InvokeFn) -> Self {
        Self::Invoke { service, args, call }
    }

    /// Transform the result of `inner`
    pub fn map<F>(inner: Plan, service: ServiceType, map: F) -> Self
    where
        F: Fn(Instance) -> Result<Instance> + Send + Sync + 'static,
    {
        Self::Convert {
            service,
            cast: Arc::new(map),
            inner: Box::new(inner),
        }
    }

    #[inline]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Interpret the plan against a container view
    pub fn execute(&self, container: &Container) -> Result<Option<Instance>> {
        match self {
            Self::Constant(instance) => Ok(Some(Arc::clone(instance))),
            Self::Invoke { service, args, call } => {
                let values = args
                    .iter()
                    .map(|arg| arg.execute(container))
                    .collect::<Result<Vec<_>>>()?;
                call(&InvokeArgs::new(&values, container, service)).map(Some)
            }
            Self::Reused {
                service,
                target,
                slot,
                disposal,
                inner,
            } => run_reused(container, service, target, *slot, disposal.as_ref(), || inner.execute(container)),
            Self::Tracked {
                service,
                target,
                disposal,
                inner,
            } => run_tracked(container, service, target, disposal, inner.execute(container)?),
            Self::ResolutionScope { service, inner } => run_in_resolution_scope(container, service, |bound| inner.execute(bound)),
            Self::ResolutionCall(call) => call.execute(container),
            Self::Deferred { info, inline } => Ok(Some(deferred(container, info, inline))),
            Self::Used { service, fallback } => match used_instance(container, service) {
                Some(instance) => Ok(Some(instance)),
                None => match fallback {
                    Some(plan) => plan.execute(container),
                    None => Err(collected(service)),
                },
            },
            Self::Convert { cast, inner, .. } => match inner.execute(container)? {
                Some(instance) => cast(instance).map(Some),
                None => Ok(None),
            },
            Self::Missing => Ok(None),
        }
    }

    /// Compile into a closure tree
    pub(crate) fn compile(&self) -> CompiledPlan {
        match self {
            Self::Constant(instance) => {
                let instance = Arc::clone(instance);
                Arc::new(move |_| Ok(Some(Arc::clone(&instance))))
            }
            Self::Invoke { service, args, call } => {
                let args: Vec<CompiledPlan> = args.iter().map(Plan::compile).collect();
                let call = Arc::clone(call);
                let service = service.clone();
                Arc::new(move |container| {
                    let values = args.iter().map(|arg| arg(container)).collect::<Result<Vec<_>>>()?;
                    call(&InvokeArgs::new(&values, container, &service)).map(Some)
                })
            }
            Self::Reused {
                service,
                target,
                slot,
                disposal,
                inner,
            } => {
                let inner = inner.compile();
                let (service, target, slot, disposal) = (service.clone(), target.clone(), *slot, disposal.clone());
                Arc::new(move |container| {
                    run_reused(container, &service, &target, slot, disposal.as_ref(), || inner(container))
                })
            }
            Self::Tracked {
                service,
                target,
                disposal,
                inner,
            } => {
                let inner = inner.compile();
                let (service, target, disposal) = (service.clone(), target.clone(), disposal.clone());
                Arc::new(move |container| run_tracked(container, &service, &target, &disposal, inner(container)?))
            }
            Self::ResolutionScope { service, inner } => {
                let inner = inner.compile();
                let service = service.clone();
                Arc::new(move |container| run_in_resolution_scope(container, &service, |bound| inner(bound)))
            }
            Self::Convert { cast, inner, .. } => {
                let inner = inner.compile();
                let cast = Arc::clone(cast);
                Arc::new(move |container| match inner(container)? {
                    Some(instance) => cast(instance).map(Some),
                    None => Ok(None),
                })
            }
            Self::Missing => Arc::new(|_| Ok(None)),
            Self::Used { service, fallback } => {
                let fallback = fallback.as_ref().map(|plan| plan.compile());
                let service = service.clone();
                Arc::new(move |container| match used_instance(container, &service) {
                    Some(instance) => Ok(Some(instance)),
                    None => match &fallback {
                        Some(plan) => plan(container),
                        None => Err(collected(&service)),
                    },
                })
            }
            Self::ResolutionCall(_) | Self::Deferred { .. } => {
                let plan = self.clone();
                Arc::new(move |container| plan.execute(container))
            }
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(_) => f.write_str("Constant"),
            Self::Invoke { service, args, .. } => f.debug_struct("Invoke").field("service", service).field("args", args).finish(),
            Self::Reused {
                service,
                target,
                slot,
                inner,
                ..
            } => f
                .debug_struct("Reused")
                .field("service", service)
                .field("target", target)
                .field("slot", slot)
                .field("inner", inner)
                .finish(),
            Self::Tracked { service, target, inner, .. } => f
                .debug_struct("Tracked")
                .field("service", service)
                .field("target", target)
                .field("inner", inner)
                .finish(),
            Self::ResolutionScope { service, inner } => f
                .debug_struct("ResolutionScope")
                .field("service", service)
                .field("inner", inner)
                .finish(),
            Self::ResolutionCall(call) => f.debug_tuple("ResolutionCall").field(&call.info).finish(),
            Self::Deferred { info, inline } => f
                .debug_struct("Deferred")
                .field("info", info)
                .field("inline", &inline.is_some())
                .finish(),
            Self::Used { service, fallback } => f
                .debug_struct("Used")
                .field("service", service)
                .field("fallback", fallback)
                .finish(),
            Self::Convert { service, inner, .. } => f.debug_struct("Convert").field("service", service).field("inner", inner).finish(),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

// ===== Execution helpers shared by interpreted and compiled plans =====

fn run_reused<F>(
    container: &Container,
    service: &ServiceType,
    target: &ReuseTarget,
    slot: u64,
    disposal: Option<&Disposal>,
    create: F,
) -> Result<Option<Instance>>
where
    F: FnOnce() -> Result<Option<Instance>>,
{
    let current = container.current_scope();
    let scope = target.select(container.singletons(), current.as_ref(), service)?;
    let instance = scope.get_or_add(
        slot,
        service,
        || {
            create()?.ok_or_else(|| DiError::CreationFailed {
                service: service.name().to_string(),
                reason: "factory produced no instance".into(),
            })
        },
        disposal,
    )?;
    Ok(Some(instance))
}

fn run_tracked(
    container: &Container,
    service: &ServiceType,
    target: &ReuseTarget,
    disposal: &Disposal,
    created: Option<Instance>,
) -> Result<Option<Instance>> {
    let Some(instance) = created else {
        return Ok(None);
    };
    let current = container.current_scope();
    let scope = target.select(container.singletons(), current.as_ref(), service)?;
    scope.track(service, Arc::clone(&instance), disposal)?;
    Ok(Some(instance))
}

fn run_in_resolution_scope<F>(container: &Container, service: &ServiceType, run: F) -> Result<Option<Instance>>
where
    F: FnOnce(&Container) -> Result<Option<Instance>>,
{
    let owner = container
        .current_scope()
        .unwrap_or_else(|| Arc::clone(container.singletons()));
    let scope = Scope::new(
        Some(Arc::clone(&owner)),
        Some(service.name().into()),
        container.rules().wait_timeout(),
    );

    #[cfg(feature = "logging")]
    trace!(
        target: "scoped_injector",
        service = service.name(),
        scope_id = scope.id(),
        "Opened resolution scope"
    );

    match run(&container.bound_to(Arc::clone(&scope))) {
        Ok(instance) => {
            let disposal = Disposal::new(Arc::new(|owned: &Instance| {
                owned.downcast_ref::<Scope>().map_or(Ok(()), Scope::dispose)
            }));
            owner.track(service, scope as Instance, &disposal)?;
            Ok(instance)
        }
        Err(err) => {
            // The resolution error wins; a teardown failure is only reported
            if let Err(_teardown) = scope.dispose() {
                #[cfg(feature = "logging")]
                warn!(
                    target: "scoped_injector",
                    service = service.name(),
                    scope_id = scope.id(),
                    error = %_teardown,
                    "Disposing the failed resolution scope also failed"
                );
            }
            Err(err)
        }
    }
}

fn used_instance(container: &Container, service: &ServiceType) -> Option<Instance> {
    container
        .current_scope()
        .and_then(|scope| scope.used_instance(service))
        .or_else(|| container.singletons().used_instance(service))
}

fn collected(service: &ServiceType) -> DiError {
    DiError::InstanceCollected {
        service: service.name().to_string(),
    }
}

fn deferred(container: &Container, info: &ServiceInfo, inline: &Option<Arc<Plan>>) -> Instance {
    Arc::new(Thunk {
        container: container.downgrade(),
        info: info.clone(),
        inline: inline.clone(),
    })
}

// =============================================================================
// Invoke arguments
// =============================================================================

/// Resolved arguments handed to a creation function.
pub struct InvokeArgs<'a> {
    values: &'a [Option<Instance>],
    container: &'a Container,
    service: &'a ServiceType,
}

impl<'a> InvokeArgs<'a> {
    pub(crate) fn new(values: &'a [Option<Instance>], container: &'a Container, service: &'a ServiceType) -> Self {
        Self {
            values,
            container,
            service,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Erased argument; fails when it was not resolved
    pub fn instance(&self, index: usize) -> Result<Instance> {
        self.values
            .get(index)
            .cloned()
            .flatten()
            .ok_or_else(|| DiError::CreationFailed {
                service: self.service.name().to_string(),
                reason: format!("argument {index} was not resolved"),
            })
    }

    /// Typed required argument
    pub fn get<T: Injectable>(&self, index: usize) -> Result<Arc<T>> {
        downcast_instance(self.instance(index)?, self.service)
    }

    /// Typed optional argument
    pub fn optional<T: Injectable>(&self, index: usize) -> Result<Option<Arc<T>>> {
        match self.values.get(index).cloned().flatten() {
            Some(instance) => downcast_instance(instance, self.service).map(Some),
            None => Ok(None),
        }
    }

    /// The container view the plan runs against
    #[inline]
    pub fn container(&self) -> &Container {
        self.container
    }

    /// The service being created
    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        self.service
    }
}

// =============================================================================
// Resolution calls
// =============================================================================

thread_local! {
    static ACTIVE_CALLS: RefCell<Vec<FactoryId>> = const { RefCell::new(Vec::new()) };
}

struct ActiveCall(FactoryId);

impl ActiveCall {
    fn enter(id: FactoryId, info: &ServiceInfo) -> Result<Self> {
        ACTIVE_CALLS.with(|calls| {
            let mut calls = calls.borrow_mut();
            if calls.contains(&id) {
                return Err(DiError::recursive(
                    info.service_type().name(),
                    format!("{info} re-entered its own resolution call"),
                ));
            }
            calls.push(id);
            Ok(Self(id))
        })
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        ACTIVE_CALLS.with(|calls| {
            let mut calls = calls.borrow_mut();
            if let Some(position) = calls.iter().rposition(|id| *id == self.0) {
                calls.remove(position);
            }
        });
    }
}

/// A sub-plan built out of line on first execution, pinned to one factory.
pub struct ResolutionCall {
    info: ServiceInfo,
    factory: FactoryRef,
    plan: OnceCell<Plan>,
}

impl ResolutionCall {
    pub(crate) fn new(info: ServiceInfo, factory: FactoryRef) -> Self {
        Self {
            info,
            factory,
            plan: OnceCell::new(),
        }
    }

    pub(crate) fn prebuilt(info: ServiceInfo, factory: FactoryRef, plan: Plan) -> Self {
        Self {
            info,
            factory,
            plan: OnceCell::with_value(plan),
        }
    }

    /// The request this call resolves
    #[inline]
    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    fn execute(&self, container: &Container) -> Result<Option<Instance>> {
        let _active = ActiveCall::enter(self.factory.id(), &self.info)?;
        let plan = self
            .plan
            .get_or_try_init(|| container.plan_resolution_call(&self.info, &self.factory))?;
        plan.execute(container)
    }
}

// =============================================================================
// Thunk
// =============================================================================

/// Deferred resolution handle produced for lazily wrapped dependencies.
///
/// Holds the container weakly; resolving after the container is gone fails with
/// [`DiError::ContainerDisposed`].
pub struct Thunk {
    container: WeakContainer,
    info: ServiceInfo,
    inline: Option<Arc<Plan>>,
}

impl Thunk {
    /// The deferred request
    #[inline]
    pub fn service_info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Resolve now (every call runs the plan again; reuse applies as usual)
    pub fn resolve(&self) -> Result<Option<Instance>> {
        let container = self.container.upgrade()?;
        match &self.inline {
            Some(plan) => plan.execute(&container),
            None => container.resolve(&self.info),
        }
    }

    /// Resolve and downcast
    pub fn get<T: Injectable>(&self) -> Result<Arc<T>> {
        let instance = self.resolve()?.ok_or_else(|| {
            DiError::not_registered(self.info.service_type().name(), "", "deferred resolution produced nothing")
        })?;
        downcast_instance(instance, self.info.service_type())
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk").field("info", &self.info).finish()
    }
}
