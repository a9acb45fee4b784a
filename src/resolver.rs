//! Factory matching and plan construction
//!
//! Everything between "a request for a service" and "the plan that builds it"
//! lives here as `pub(crate)` methods on [`Container`]:
//!
//! 1. per-call arguments and `use_instance` overrides,
//! 2. decorator selection,
//! 3. factory matching (selector, exact/open entry, dynamic providers, tie
//!    breaks, wrappers, unknown-service resolvers, parent container),
//! 4. binding the factory to the request and wrapping its plan in reuse,
//!    tracking, conversion and resolution-call boundaries.

use crate::plan::ResolutionCall;
use crate::provider::describe_key;
use crate::registry::{Registry, same_implementation};
use crate::rules::ProviderFlags;
use crate::{
    Container, DiError, FactoryId, FactoryKind, FactoryRef, IfAlreadyRegistered, IfUnresolved, InvokeFn, Plan,
    Request, RequestFlags, Result, Reuse, Rules, ServiceInfo, ServiceKey, ServiceType,
};
use ahash::RandomState;
use once_cell::sync::Lazy;
use std::hash::BuildHasher;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Slot ids of decorators and wrappers carry the high bit; factory ids never do
const DERIVED_SLOT_BIT: u64 = 1 << 63;

static SLOT_HASHER: Lazy<RandomState> = Lazy::new(RandomState::new);

/// Outcome of factory matching
pub(crate) enum Lookup {
    Found(FactoryRef),
    /// Resolve through the parent container at run time
    Parent(Container),
    Unresolved(Unresolved),
}

/// Why a request did not resolve
pub(crate) enum Unresolved {
    /// Nothing is registered for the service type
    NotRegistered,
    /// Registrations exist but none matched key, condition or required type
    NoMatch,
    /// The matched factory produced no plan
    Declined(FactoryId),
    Ambiguous(Vec<(ServiceKey, FactoryRef)>),
}

type Candidates = Vec<(ServiceKey, FactoryRef)>;

impl Container {
    // =========================================================================
    // Entry points
    // =========================================================================

    /// Plan the service described by an unbound request
    pub(crate) fn plan_for(&self, request: &Request) -> Result<Plan> {
        if let Some(seed) = request.seed_for(request.service_type()) {
            request.mark_uncacheable();
            return match self.find_decorator(request)? {
                Some(decorator) => self.plan_with_factory(request, decorator),
                None => Ok(Plan::Constant(seed)),
            };
        }

        if request.has_args() {
            request.mark_uncacheable();
            if !request.is_resolution_root() {
                if let Some(arg) = request.arg_for(request.service_type()) {
                    return Ok(Plan::Constant(arg));
                }
            }
        }

        if request.registry().has_used_instances(request.service_type().id()) {
            let fallback = match self.plan_service(request) {
                Ok(plan) => Some(Box::new(plan)),
                Err(err) if err.is_unresolved() => None,
                Err(err) => return Err(err),
            };
            return Ok(Plan::Used {
                service: request.service_type().clone(),
                fallback,
            });
        }

        self.plan_service(request)
    }

    /// Plan a lazily resolved dependency.
    ///
    /// The target is planned inline unless its factory is already being
    /// planned higher up the chain; then the returned thunk resolves it at run
    /// time instead.
    pub(crate) fn plan_deferred(&self, request: &Request) -> Result<Plan> {
        let info = request.info().clone();
        if let Lookup::Found(factory) = self.match_factory(request)? {
            if request.has_ancestor_factory(factory.id()) {
                #[cfg(feature = "logging")]
                trace!(
                    target: "scoped_injector",
                    service = info.service_type().name(),
                    factory_id = factory.id().get(),
                    "Deferred dependency closes a cycle, resolving at run time"
                );
                return Ok(Plan::Deferred { info, inline: None });
            }
        }

        let plan = self.plan_for(request)?;
        if plan.is_missing() {
            return Ok(Plan::Missing);
        }
        Ok(Plan::Deferred {
            info,
            inline: Some(Arc::new(plan)),
        })
    }

    /// Plan the body of a resolution call from a fresh chain
    pub(crate) fn plan_resolution_call(&self, info: &ServiceInfo, factory: &FactoryRef) -> Result<Plan> {
        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_injector",
            service = info.service_type().name(),
            factory_id = factory.id().get(),
            "Planning resolution call"
        );

        let root = Request::root(self, Vec::new());
        let request = root.push_with(
            info.clone(),
            RequestFlags::STOP_RECURSION_CHECK | RequestFlags::IS_RESOLUTION_CALL,
        );
        self.plan_with_factory(&request, Arc::clone(factory))
    }

    fn plan_service(&self, request: &Request) -> Result<Plan> {
        if let Some(decorator) = self.find_decorator(request)? {
            return self.plan_with_factory(request, decorator);
        }
        match self.match_factory(request)? {
            Lookup::Found(factory) => self.plan_with_factory(request, factory),
            Lookup::Parent(parent) => Ok(parent_plan(parent, request.info())),
            Lookup::Unresolved(reason) => self.unresolved(request, reason),
        }
    }

    // =========================================================================
    // Plan construction
    // =========================================================================

    /// Bind `factory` to the request and build its wrapped plan
    pub(crate) fn plan_with_factory(&self, request: &Request, factory: FactoryRef) -> Result<Plan> {
        let request = request.with_resolved_factory(Arc::clone(&factory))?;
        let setup = factory.setup();
        let reuse = request.reuse().cloned().unwrap_or_default();
        if setup.is_do_not_cache() {
            request.mark_uncacheable();
        }

        if setup.is_resolution_call() && !request.is_resolution_root() {
            return Ok(Plan::ResolutionCall(Arc::new(ResolutionCall::new(
                request.info().clone(),
                factory,
            ))));
        }

        let registry = Arc::clone(request.registry());
        let expression_cacheable = factory.kind() == FactoryKind::Service
            && !setup.is_do_not_cache()
            && !request.has_args()
            && request.is_in_transient_context();

        let cached = if expression_cacheable {
            registry.cached_expression(factory.id(), &reuse, request.tracked_target())
        } else {
            None
        };

        let plan = match cached {
            Some(plan) => {
                #[cfg(feature = "logging")]
                trace!(
                    target: "scoped_injector",
                    service = request.service_type().name(),
                    factory_id = factory.id().get(),
                    "Reusing cached factory plan"
                );
                plan
            }
            None => {
                let Some(created) = factory.factory().create_plan(&request)? else {
                    return self.unresolved(&request, Unresolved::Declined(factory.id()));
                };
                if created.is_missing() {
                    return Ok(Plan::Missing);
                }
                let plan = self.wrap_reuse(&request, &factory, &reuse, created)?;
                if expression_cacheable && !request.is_context_sensitive() && !request.is_uncacheable() {
                    registry.cache_expression(factory.id(), reuse, request.tracked_target().cloned(), plan.clone());
                }
                plan
            }
        };

        let plan = match factory.cast_to(request.service_type()) {
            Some(cast) => Plan::Convert {
                service: request.service_type().clone(),
                cast,
                inner: Box::new(plan),
            },
            None => plan,
        };

        if let Some(threshold) = self.rules().graph_split_threshold() {
            if !request.is_resolution_root() && request.dependency_count() > threshold {
                setup.force_resolution_call();

                #[cfg(feature = "logging")]
                debug!(
                    target: "scoped_injector",
                    service = request.service_type().name(),
                    factory_id = factory.id().get(),
                    dependencies = request.dependency_count(),
                    threshold = threshold,
                    "Splitting large graph into a resolution call"
                );

                return Ok(Plan::ResolutionCall(Arc::new(ResolutionCall::prebuilt(
                    request.info().clone(),
                    factory,
                    plan,
                ))));
            }
        }

        Ok(plan)
    }

    fn wrap_reuse(&self, request: &Request, factory: &FactoryRef, reuse: &Reuse, plan: Plan) -> Result<Plan> {
        let setup = factory.setup();
        let service = request.service_type().clone();

        let plan = if setup.opens_resolution_scope() {
            Plan::ResolutionScope {
                service: service.clone(),
                inner: Box::new(plan),
            }
        } else {
            plan
        };

        match reuse.target() {
            Some(target) => {
                let reused = Plan::Reused {
                    service,
                    target,
                    slot: slot_id(factory, request),
                    disposal: setup.disposal(),
                    inner: Box::new(plan),
                };
                if *reuse == Reuse::Singleton && self.rules().eager_singletons() {
                    return Ok(match reused.execute(self)? {
                        Some(instance) => Plan::Constant(instance),
                        None => Plan::Missing,
                    });
                }
                Ok(reused)
            }
            None => match (request.tracked_target(), setup.disposal()) {
                (Some(target), Some(disposal)) => Ok(Plan::Tracked {
                    service,
                    target: target.clone(),
                    disposal,
                    inner: Box::new(plan),
                }),
                _ => Ok(plan),
            },
        }
    }

    // =========================================================================
    // Decorators
    // =========================================================================

    /// The next decorator to apply to the request, if any
    fn find_decorator(&self, request: &Request) -> Result<Option<FactoryRef>> {
        let registry = request.registry();
        let rules = self.rules();
        let service = request.service_type();

        let mut types = vec![service.id()];
        if let Some(required) = request.required_type() {
            types.push(required.id());
        }
        if let Some(definition) = service.generic_definition() {
            types.push(definition.id());
        }

        let mut candidates = registry.decorators_for(&types, !request.is_seeded());
        if rules.has_providers(ProviderFlags::DECORATOR) {
            for provider in rules
                .dynamic_providers()
                .iter()
                .filter(|provider| provider.flags().contains(ProviderFlags::DECORATOR))
            {
                for provided in provider.provide(service, request.key()) {
                    if !candidates.iter().any(|c| c.id() == provided.factory.id()) {
                        candidates.push(provided.factory);
                    }
                }
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        request.mark_context_sensitive();

        let key = request.key().cloned().unwrap_or_default();
        let mut decorators = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(closed) = close(&candidate, service, &key)? {
                decorators.push(closed);
            }
        }
        // Highest order wraps outermost; later registrations win ties
        decorators.sort_by(|a, b| {
            b.setup()
                .order()
                .cmp(&a.setup().order())
                .then_with(|| b.id().cmp(&a.id()))
        });

        // The nearest applied decorator is the innermost one so far; only
        // decorators ranked below it are left to apply.
        let applied = request
            .ancestors()
            .take_while(|ancestor| ancestor.service_type() == service)
            .find_map(|ancestor| {
                let id = ancestor.factory_id()?;
                decorators.iter().position(|d| d.id() == id)
            });
        let start = applied.map_or(0, |position| position + 1);

        Ok(decorators
            .into_iter()
            .skip(start)
            .find(|decorator| decorator.setup().matches(request)))
    }

    // =========================================================================
    // Factory matching
    // =========================================================================

    /// Find the factory serving the request
    pub(crate) fn match_factory(&self, request: &Request) -> Result<Lookup> {
        let registry = Arc::clone(request.registry());
        let rules = self.rules();
        let key = request.key();
        let (lookup, required_implementation) = lookup_type(&registry, request);

        if key.is_none() {
            if let Some(selector) = rules.factory_selector() {
                let candidates = self.candidates(&registry, &lookup, None)?;
                request.mark_context_sensitive();
                return match selector(request, &candidates) {
                    Some(selected) => match close(&selected, &lookup, &ServiceKey::Default)? {
                        Some(factory) => Ok(Lookup::Found(factory)),
                        None => self.fallback(request, Unresolved::NoMatch),
                    },
                    None if candidates.is_empty() => self.fallback(request, Unresolved::NotRegistered),
                    None => self.fallback(request, Unresolved::NoMatch),
                };
            }
        }

        let exact = registry.entry(lookup.id());
        let definition = lookup.generic_definition();
        let open = definition.as_ref().and_then(|d| registry.entry(d.id()));
        let entry = match (exact, key) {
            (Some(entry), None) => Some(entry),
            (Some(entry), Some(key)) if entry.keyed(key).is_some() => Some(entry),
            (exact, _) => open.or(exact),
        };

        let dynamic = rules.has_providers(ProviderFlags::SERVICE);
        if !dynamic && key.is_none() && required_implementation.is_none() {
            if let Some(single) = entry.and_then(|entry| entry.single()) {
                if single.setup().condition().is_some() {
                    request.mark_context_sensitive();
                    if !single.setup().matches(request) {
                        return self.fallback(request, Unresolved::NoMatch);
                    }
                }
                return match close(single, &lookup, &ServiceKey::Default)? {
                    Some(factory) => Ok(Lookup::Found(factory)),
                    None => self.fallback(request, Unresolved::NoMatch),
                };
            }
        }

        let mut candidates: Candidates = entry.map(|entry| entry.factories().to_vec()).unwrap_or_default();
        if dynamic {
            merge_dynamic(rules, &lookup, key, &mut candidates)?;
        }
        if candidates.is_empty() {
            return self.fallback(request, Unresolved::NotRegistered);
        }

        let mut matched: Candidates = Vec::new();
        for (candidate_key, factory) in candidates {
            let key_matches = match key {
                Some(key) => candidate_key == *key,
                None => candidate_key.is_default_like(),
            };
            if !key_matches {
                continue;
            }
            if factory.setup().condition().is_some() {
                request.mark_context_sensitive();
                if !factory.setup().matches(request) {
                    continue;
                }
            }
            let Some(factory) = close(&factory, &lookup, &candidate_key)? else {
                continue;
            };
            if let Some(required) = &required_implementation {
                if factory.implementation_type().as_ref() != Some(required) {
                    continue;
                }
            }
            matched.push((candidate_key, factory));
        }

        match matched.len() {
            0 => self.fallback(request, Unresolved::NoMatch),
            1 => Ok(Lookup::Found(matched.swap_remove(0).1)),
            _ => match break_tie(rules, matched) {
                Ok(factory) => Ok(Lookup::Found(factory)),
                Err(ambiguous) => Ok(Lookup::Unresolved(Unresolved::Ambiguous(ambiguous))),
            },
        }
    }

    /// Wrappers, unknown-service resolvers and the parent container, in order
    fn fallback(&self, request: &Request, reason: Unresolved) -> Result<Lookup> {
        let registry = request.registry();
        let service = request.service_type();

        let wrapper = registry.wrapper(service.id()).or_else(|| {
            service
                .generic_definition()
                .and_then(|definition| registry.wrapper(definition.id()))
        });
        if let Some(wrapper) = wrapper {
            return Ok(Lookup::Found(Arc::clone(wrapper)));
        }

        for resolver in self.rules().unknown_service_resolvers() {
            if let Some(factory) = resolver(request) {
                #[cfg(feature = "logging")]
                debug!(
                    target: "scoped_injector",
                    service = service.name(),
                    factory_id = factory.id().get(),
                    "Unknown service resolved by fallback resolver"
                );
                return Ok(Lookup::Found(factory));
            }
        }

        if let Some(parent) = self.parent() {
            if parent.can_resolve(request.info()) {
                return Ok(Lookup::Parent(parent.clone()));
            }
        }

        Ok(Lookup::Unresolved(reason))
    }

    /// Every registration that could serve `service` (static, open-generic and
    /// dynamic), optionally restricted to one key
    pub(crate) fn candidates(&self, registry: &Registry, service: &ServiceType, key: Option<&ServiceKey>) -> Result<Candidates> {
        let mut candidates: Candidates = registry
            .entry(service.id())
            .map(|entry| entry.factories().to_vec())
            .unwrap_or_default();

        if let Some(definition) = service.generic_definition() {
            if let Some(open) = registry.entry(definition.id()) {
                for (open_key, factory) in open.factories() {
                    if !candidates.iter().any(|(existing, _)| existing == open_key) {
                        candidates.push((open_key.clone(), Arc::clone(factory)));
                    }
                }
            }
        }

        if self.rules().has_providers(ProviderFlags::SERVICE) {
            merge_dynamic(self.rules(), service, key, &mut candidates)?;
        }
        if let Some(key) = key {
            candidates.retain(|(candidate_key, _)| candidate_key == key);
        }
        Ok(candidates)
    }

    /// Whether the container (or its parents) has anything that might serve `info`
    pub(crate) fn can_resolve(&self, info: &ServiceInfo) -> bool {
        let registry = self.registry();
        let rules = self.rules();
        let service = info.service_type();
        let mut types = vec![service.id()];
        if let Some(required) = info.required_type() {
            types.push(required.id());
        }
        if let Some(definition) = service.generic_definition() {
            types.push(definition.id());
        }

        types.iter().any(|id| {
            registry.entry(*id).is_some() || registry.wrapper(*id).is_some() || registry.has_used_instances(*id)
        }) || rules.has_providers(ProviderFlags::SERVICE)
            || !rules.unknown_service_resolvers().is_empty()
            || self.parent().is_some_and(|parent| parent.can_resolve(info))
    }

    // =========================================================================
    // Unresolved requests
    // =========================================================================

    fn unresolved(&self, request: &Request, reason: Unresolved) -> Result<Plan> {
        match request.if_unresolved() {
            IfUnresolved::ReturnDefault => return Ok(Plan::Missing),
            IfUnresolved::ReturnDefaultIfNotRegistered if matches!(reason, Unresolved::NotRegistered) => {
                return Ok(Plan::Missing);
            }
            _ => {}
        }

        let err = self.unresolved_error(request, reason);

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_injector",
            service = request.service_type().name(),
            depth = request.depth(),
            error = %err,
            "Service could not be resolved"
        );

        Err(err)
    }

    fn unresolved_error(&self, request: &Request, reason: Unresolved) -> DiError {
        let service = request.service_type().name().to_string();
        let key = describe_key(request.key());
        match reason {
            Unresolved::NotRegistered => DiError::not_registered(service, key, self.describe_attempts(request)),
            Unresolved::NoMatch => DiError::FallbacksExhausted {
                service,
                key,
                attempted: self.describe_attempts(request),
            },
            Unresolved::Declined(id) => DiError::FallbacksExhausted {
                service,
                key,
                attempted: format!("Factory {id} declined the request."),
            },
            Unresolved::Ambiguous(candidates) => DiError::Ambiguous {
                service,
                key,
                count: candidates.len(),
                candidates: candidates
                    .iter()
                    .map(|(key, factory)| format!("{key} -> {}", factory.id()))
                    .collect::<Vec<_>>()
                    .join(", "),
            },
        }
    }

    fn describe_attempts(&self, request: &Request) -> String {
        let mut attempted = vec!["registry".to_string()];
        if let Some(definition) = request.service_type().generic_definition() {
            attempted.push(format!("open-generic {definition}"));
        }
        attempted.push("wrappers".to_string());
        let resolvers = self.rules().unknown_service_resolvers().len();
        if resolvers > 0 {
            attempted.push(format!("{resolvers} unknown-service resolver(s)"));
        }
        if self.parent().is_some() {
            attempted.push("parent container".to_string());
        }

        let mut message = format!("Tried: {}.", attempted.join(", "));
        if let Some(owner) = request.ancestors().next() {
            message.push_str(&format!(" Required by {}.", owner.service_type()));
        }
        message
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Slot id of a reused factory in its scope
fn slot_id(factory: &FactoryRef, request: &Request) -> u64 {
    match factory.kind() {
        FactoryKind::Service => factory.id().get(),
        // Shared across every service a decorator or wrapper applies to
        FactoryKind::Decorator | FactoryKind::Wrapper => {
            SLOT_HASHER.hash_one((factory.id(), request.service_type().id(), request.key())) | DERIVED_SLOT_BIT
        }
    }
}

/// The concrete registration of a possibly open-generic factory
fn close(factory: &FactoryRef, service: &ServiceType, key: &ServiceKey) -> Result<Option<FactoryRef>> {
    if !factory.factory().is_open_generic() {
        return Ok(Some(Arc::clone(factory)));
    }
    if !service.is_closed_generic() {
        return Ok(None);
    }
    factory.factory().close_generic(factory, service, key)
}

/// Type whose registrations are searched, plus the implementation filter when
/// the required type is not itself a usable lookup type
fn lookup_type(registry: &Registry, request: &Request) -> (ServiceType, Option<ServiceType>) {
    let service = request.service_type();
    match request.required_type() {
        None => (service.clone(), None),
        Some(required) if required == service => (service.clone(), None),
        Some(required) => {
            let serves = registry
                .entry(required.id())
                .is_some_and(|entry| entry.factories().iter().any(|(_, f)| f.can_serve(service)));
            if serves {
                (required.clone(), None)
            } else {
                (service.clone(), Some(required.clone()))
            }
        }
    }
}

/// Narrow ambiguous candidates by lifespan, condition and preference
fn break_tie(rules: &Rules, mut matched: Candidates) -> std::result::Result<FactoryRef, Candidates> {
    if rules.selects_by_min_lifespan() {
        let lifespan = |factory: &FactoryRef| factory.reuse().unwrap_or(rules.default_reuse()).lifespan();
        let min = matched.iter().map(|(_, factory)| lifespan(factory)).min();
        if let Some(factory) = narrow(&mut matched, |factory| Some(lifespan(factory)) == min) {
            return Ok(factory);
        }
    }
    if let Some(factory) = narrow(&mut matched, |factory| factory.setup().condition().is_some()) {
        return Ok(factory);
    }
    if let Some(factory) = narrow(&mut matched, |factory| factory.setup().is_preferred_in_single_resolve()) {
        return Ok(factory);
    }
    Err(matched)
}

fn narrow<P>(matched: &mut Candidates, predicate: P) -> Option<FactoryRef>
where
    P: Fn(&FactoryRef) -> bool,
{
    let subset: Candidates = matched.iter().filter(|(_, factory)| predicate(factory)).cloned().collect();
    match subset.len() {
        0 => None,
        1 => subset.into_iter().next().map(|(_, factory)| factory),
        _ => {
            *matched = subset;
            None
        }
    }
}

/// Merge registrations from dynamic providers into the static candidates
fn merge_dynamic(rules: &Rules, service: &ServiceType, key: Option<&ServiceKey>, candidates: &mut Candidates) -> Result<()> {
    let had_static = !candidates.is_empty();
    for provider in rules.dynamic_providers() {
        let flags = provider.flags();
        if !flags.contains(ProviderFlags::SERVICE) || (had_static && flags.contains(ProviderFlags::FALLBACK_ONLY)) {
            continue;
        }
        for provided in provider.provide(service, key) {
            merge_one(
                service,
                candidates,
                provided.key.unwrap_or_default(),
                provided.factory,
                provider.conflict_policy(),
            )?;
        }
    }
    Ok(())
}

fn merge_one(
    service: &ServiceType,
    candidates: &mut Candidates,
    key: ServiceKey,
    factory: FactoryRef,
    policy: IfAlreadyRegistered,
) -> Result<()> {
    if candidates.iter().any(|(_, existing)| existing.id() == factory.id()) {
        return Ok(());
    }

    if key == ServiceKey::Default {
        let existing: Vec<&FactoryRef> = candidates
            .iter()
            .filter(|(k, _)| k.is_default_like())
            .map(|(_, f)| f)
            .collect();
        let Some(first) = existing.first() else {
            candidates.push((ServiceKey::Default, factory));
            return Ok(());
        };
        match policy {
            IfAlreadyRegistered::AppendNotKeyed => {
                let index = next_index(candidates);
                candidates.push((ServiceKey::Indexed(index), factory));
            }
            IfAlreadyRegistered::Throw => {
                return Err(DiError::DuplicateDefault {
                    service: service.name().to_string(),
                    existing: first.id().get(),
                });
            }
            IfAlreadyRegistered::Keep => {}
            IfAlreadyRegistered::Replace => {
                candidates.retain(|(k, _)| !k.is_default_like());
                candidates.push((ServiceKey::Default, factory));
            }
            IfAlreadyRegistered::AppendNewImplementation => {
                if !existing.iter().any(|f| same_implementation(f, &factory)) {
                    let index = next_index(candidates);
                    candidates.push((ServiceKey::Indexed(index), factory));
                }
            }
        }
        return Ok(());
    }

    match candidates.iter().position(|(k, _)| *k == key) {
        None => candidates.push((key, factory)),
        Some(position) => match policy {
            IfAlreadyRegistered::Keep => {}
            IfAlreadyRegistered::Replace => candidates[position] = (key, factory),
            IfAlreadyRegistered::AppendNewImplementation if same_implementation(&candidates[position].1, &factory) => {}
            _ => {
                return Err(DiError::DuplicateKey {
                    service: service.name().to_string(),
                    key: key.to_string(),
                });
            }
        },
    }
    Ok(())
}

fn next_index(candidates: &Candidates) -> u32 {
    candidates
        .iter()
        .filter_map(|(k, _)| match k {
            ServiceKey::Indexed(index) => Some(*index),
            _ => None,
        })
        .max()
        .map_or(1, |index| index + 1)
}

/// Resolve through the parent container, inside the caller's current scope
fn parent_plan(parent: Container, info: &ServiceInfo) -> Plan {
    let info = info.clone();
    let service = info.service_type().clone();
    let call: InvokeFn = Arc::new(move |args| {
        let view = match args.container().current_scope() {
            Some(scope) => parent.bound_to(scope),
            None => parent.clone(),
        };
        view.resolve(&info)?.ok_or_else(|| {
            DiError::not_registered(
                info.service_type().name(),
                describe_key(info.key()),
                "The parent container produced no instance.",
            )
        })
    });
    Plan::invoke(service, Vec::new(), call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DecoratorFactory, DynamicProvider, DynamicRegistration, ErrorCode, FnFactory, Registration, Setup};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Name(String);

    fn name(value: &str) -> Registration {
        let value = value.to_string();
        Registration::delegate(move || Name(value.clone()))
    }

    #[test]
    fn test_single_default_fast_path() {
        let container = Container::new();
        container.register_service::<Name>(name("a")).unwrap();
        assert_eq!(container.get::<Name>().unwrap().0, "a");
    }

    #[test]
    fn test_two_defaults_are_ambiguous() {
        let container = Container::new();
        container.register_service::<Name>(name("a")).unwrap();
        container.register_service::<Name>(name("b")).unwrap();

        let err = container.get::<Name>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Ambiguous);
        assert!(err.to_string().contains("2 factories match"));
    }

    #[test]
    fn test_min_lifespan_breaks_tie() {
        let container = Container::new();
        container
            .register_service::<Name>(name("singleton").with_reuse(Reuse::Singleton))
            .unwrap();
        container.register_service::<Name>(name("transient")).unwrap();
        assert_eq!(container.get::<Name>().unwrap().0, "transient");

        let strict = Container::with_rules(Rules::default().without_min_lifespan_selection());
        strict
            .register_service::<Name>(name("singleton").with_reuse(Reuse::Singleton))
            .unwrap();
        strict.register_service::<Name>(name("transient")).unwrap();
        assert_eq!(strict.get::<Name>().unwrap_err().code(), ErrorCode::Ambiguous);
    }

    #[test]
    fn test_preferred_factory_wins() {
        let container = Container::new();
        container.register_service::<Name>(name("a")).unwrap();
        container
            .register_service::<Name>(name("b").with_setup(Setup::new().prefer_in_single_resolve()))
            .unwrap();
        assert_eq!(container.get::<Name>().unwrap().0, "b");
    }

    #[test]
    fn test_condition_filters_candidates() {
        let container = Container::new();
        container
            .register_service::<Name>(name("never").with_setup(Setup::new().with_condition(|_| false)))
            .unwrap();
        let err = container.get::<Name>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FallbacksExhausted);

        let optional = ServiceInfo::of::<Name>().if_unresolved(IfUnresolved::ReturnDefaultIfNotRegistered);
        assert_eq!(container.resolve(&optional).unwrap_err().code(), ErrorCode::FallbacksExhausted);
        assert!(container.resolve(&ServiceInfo::of::<Name>().optional()).unwrap().is_none());
    }

    #[test]
    fn test_keyed_lookup_is_exact() {
        let container = Container::new();
        container.register_service::<Name>(name("a")).unwrap();
        container.register_service::<Name>(name("b")).unwrap();
        container.register_keyed::<Name>("x", name("x")).unwrap();

        assert_eq!(container.get_keyed::<Name>("x").unwrap().0, "x");
        let first = container
            .get_with::<Name>(&ServiceInfo::of::<Name>().keyed(ServiceKey::Default))
            .unwrap();
        assert_eq!(first.0, "a");
        let second = container
            .get_with::<Name>(&ServiceInfo::of::<Name>().keyed(ServiceKey::Indexed(1)))
            .unwrap();
        assert_eq!(second.0, "b");
        // The unkeyed request is still ambiguous after the keyed ones were cached
        assert_eq!(container.get::<Name>().unwrap_err().code(), ErrorCode::Ambiguous);
    }

    #[test]
    fn test_decorators_compose_by_order() {
        let container = Container::new();
        container.register_service::<Name>(name("s")).unwrap();
        container
            .register_decorator::<Name>(
                Registration::new(DecoratorFactory::new(|inner: Arc<Name>| Name(format!("d2({})", inner.0))))
                    .with_setup(Setup::new().with_order(2)),
            )
            .unwrap();
        container
            .register_decorator::<Name>(
                Registration::new(DecoratorFactory::new(|inner: Arc<Name>| Name(format!("d1({})", inner.0))))
                    .with_setup(Setup::new().with_order(1)),
            )
            .unwrap();

        assert_eq!(container.get::<Name>().unwrap().0, "d2(d1(s))");
    }

    #[test]
    fn test_false_condition_skips_decorator() {
        let container = Container::new();
        container.register_service::<Name>(name("s")).unwrap();
        container
            .register_decorator::<Name>(
                Registration::new(DecoratorFactory::new(|inner: Arc<Name>| Name(format!("skipped({})", inner.0))))
                    .with_setup(Setup::new().with_condition(|_| false)),
            )
            .unwrap();
        container
            .register_decorator::<Name>(Registration::new(DecoratorFactory::new(|inner: Arc<Name>| {
                Name(format!("d({})", inner.0))
            })))
            .unwrap();

        assert_eq!(container.get::<Name>().unwrap().0, "d(s)");
    }

    #[test]
    fn test_factory_selector_picks_last() {
        let rules = Rules::default().with_factory_selector(|_, candidates| candidates.last().map(|(_, f)| Arc::clone(f)));
        let container = Container::with_rules(rules);
        container.register_service::<Name>(name("a")).unwrap();
        container.register_service::<Name>(name("b")).unwrap();
        assert_eq!(container.get::<Name>().unwrap().0, "b");
    }

    #[test]
    fn test_dynamic_provider_fallback_only() {
        let provided: FactoryRef = Arc::new(name("dynamic"));
        let provider = DynamicProvider::new(move |service, _| {
            if service.id() == std::any::TypeId::of::<Name>() {
                vec![DynamicRegistration::new(Arc::clone(&provided))]
            } else {
                Vec::new()
            }
        })
        .with_flags(ProviderFlags::SERVICE | ProviderFlags::FALLBACK_ONLY);

        let container = Container::with_rules(Rules::default().with_dynamic_provider(provider));
        assert_eq!(container.get::<Name>().unwrap().0, "dynamic");

        container.register_service::<Name>(name("static")).unwrap();
        assert_eq!(container.get::<Name>().unwrap().0, "static");
    }

    #[test]
    fn test_unknown_service_resolver() {
        let rules = Rules::default().with_unknown_service_resolver(|request| {
            (request.service_type().id() == std::any::TypeId::of::<Name>()).then(|| Arc::new(name("fallback")))
        });
        let container = Container::with_rules(rules);
        assert_eq!(container.get::<Name>().unwrap().0, "fallback");
    }

    #[test]
    fn test_recursive_transients_fail() {
        struct A;
        struct B;

        let container = Container::new();
        container
            .register_service::<A>(Registration::new(crate::DelegateFactory::with_dependencies(
                vec![ServiceInfo::of::<B>()],
                |_| Ok(A),
            )))
            .unwrap();
        container
            .register_service::<B>(Registration::new(crate::DelegateFactory::with_dependencies(
                vec![ServiceInfo::of::<A>()],
                |_| Ok(B),
            )))
            .unwrap();

        let err = container.get::<A>().err().unwrap();
        assert_eq!(err.code(), ErrorCode::RecursiveDependency);
    }

    #[test]
    fn test_declining_factory_is_unresolved() {
        let container = Container::new();
        container
            .register_service::<Name>(Registration::new(FnFactory::new(|_| Ok(None))))
            .unwrap();
        let err = container.get::<Name>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::FallbacksExhausted);
        assert!(err.to_string().contains("declined"));
    }

    #[test]
    fn test_graph_split_creates_resolution_call() {
        struct Leaf(u32);
        struct Middle;
        struct Top;

        let created = Arc::new(AtomicU32::new(0));
        let container = Container::with_rules(Rules::default().with_graph_split_threshold(1));
        let counter = Arc::clone(&created);
        container
            .register_service::<Leaf>(Registration::delegate(move || Leaf(counter.fetch_add(1, Ordering::SeqCst))))
            .unwrap();
        let middle = Registration::new(crate::DelegateFactory::with_dependencies(
            vec![ServiceInfo::of::<Leaf>(), ServiceInfo::of::<Leaf>()],
            |_| Ok(Middle),
        ));
        let middle_id = container.register_service::<Middle>(middle).unwrap().unwrap();
        container
            .register_service::<Top>(Registration::new(crate::DelegateFactory::with_dependencies(
                vec![ServiceInfo::of::<Middle>()],
                |_| Ok(Top),
            )))
            .unwrap();

        container.get::<Top>().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);

        let forced = container
            .registered_services()
            .into_iter()
            .find(|registered| registered.factory.id() == middle_id)
            .unwrap();
        assert!(forced.factory.setup().is_resolution_call());

        container.get::<Top>().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_slot_ids_of_decorators_are_derived() {
        let container = Container::new();
        let root = Request::root(&container, Vec::new());
        let request = root.push(ServiceInfo::of::<Name>());
        let decorator = Arc::new(
            Registration::new(DecoratorFactory::new(|inner: Arc<Name>| Name(inner.0.clone()))).into_kind(FactoryKind::Decorator),
        );
        let service = Arc::new(name("s"));

        assert_eq!(slot_id(&service, &request), service.id().get());
        let derived = slot_id(&decorator, &request);
        assert_ne!(derived & DERIVED_SLOT_BIT, 0);
        assert_eq!(derived, slot_id(&decorator, &request));
    }
}
