//! Container rules
//!
//! [`Rules`] hold every container-wide policy knob: default reuse and conflict
//! policy, graph checks, factory selection, dynamic registration providers and
//! fallback resolvers. Rules are immutable once the container is built; use the
//! `with_*` / `without_*` builders to derive a new set.

use crate::{FactoryRef, IfAlreadyRegistered, Request, Reuse, ServiceKey, ServiceType};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout while waiting for another caller to create a shared instance
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Picks one factory among all candidates for a request
pub type FactorySelector = Arc<dyn Fn(&Request, &[(ServiceKey, FactoryRef)]) -> Option<FactoryRef> + Send + Sync>;

/// Last-resort producer of a factory for an otherwise unresolved request
pub type UnknownServiceResolver = Arc<dyn Fn(&Request) -> Option<FactoryRef> + Send + Sync>;

/// Produces registrations on demand for a service type and optional key
pub type ProviderFn = Arc<dyn Fn(&ServiceType, Option<&ServiceKey>) -> Vec<DynamicRegistration> + Send + Sync>;

/// A registration supplied by a dynamic provider.
///
/// Providers should hand out the same `FactoryRef` for the same logical
/// registration every time; reuse slots are keyed by factory id.
#[derive(Clone)]
pub struct DynamicRegistration {
    pub factory: FactoryRef,
    pub key: Option<ServiceKey>,
}

impl DynamicRegistration {
    pub fn new(factory: FactoryRef) -> Self {
        Self { factory, key: None }
    }

    pub fn keyed(factory: FactoryRef, key: impl Into<ServiceKey>) -> Self {
        Self {
            factory,
            key: Some(key.into()),
        }
    }
}

/// What a dynamic provider contributes to
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProviderFlags(u8);

impl ProviderFlags {
    /// Contributes service factories
    pub const SERVICE: Self = Self(1);
    /// Contributes decorators
    pub const DECORATOR: Self = Self(1 << 1);
    /// Only consulted when no static registration exists
    pub const FALLBACK_ONLY: Self = Self(1 << 2);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProviderFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ProviderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderFlags({:#05b})", self.0)
    }
}

/// A dynamic registration provider with its merge policy
#[derive(Clone)]
pub struct DynamicProvider {
    flags: ProviderFlags,
    conflict: IfAlreadyRegistered,
    provide: ProviderFn,
}

impl DynamicProvider {
    /// A service provider merged with [`IfAlreadyRegistered::AppendNotKeyed`]
    pub fn new<F>(provide: F) -> Self
    where
        F: Fn(&ServiceType, Option<&ServiceKey>) -> Vec<DynamicRegistration> + Send + Sync + 'static,
    {
        Self {
            flags: ProviderFlags::SERVICE,
            conflict: IfAlreadyRegistered::AppendNotKeyed,
            provide: Arc::new(provide),
        }
    }

    pub fn with_flags(mut self, flags: ProviderFlags) -> Self {
        self.flags = flags;
        self
    }

    /// How provided registrations merge with static ones
    pub fn with_conflict_policy(mut self, conflict: IfAlreadyRegistered) -> Self {
        self.conflict = conflict;
        self
    }

    #[inline]
    pub fn flags(&self) -> ProviderFlags {
        self.flags
    }

    #[inline]
    pub fn conflict_policy(&self) -> IfAlreadyRegistered {
        self.conflict
    }

    #[inline]
    pub(crate) fn provide(&self, service: &ServiceType, key: Option<&ServiceKey>) -> Vec<DynamicRegistration> {
        (self.provide)(service, key)
    }
}

/// Container-wide policies.
///
/// # Examples
///
/// ```rust
/// use scoped_injector::{Container, Reuse, Rules};
///
/// let rules = Rules::default()
///     .with_default_reuse(Reuse::Singleton)
///     .with_tracking_disposable_transients();
/// let container = Container::with_rules(rules);
/// assert!(container.rules().tracks_disposable_transients());
/// ```
#[derive(Clone)]
pub struct Rules {
    default_reuse: Reuse,
    default_if_already_registered: IfAlreadyRegistered,
    factory_selector: Option<FactorySelector>,
    dynamic_providers: Vec<DynamicProvider>,
    unknown_service_resolvers: Vec<UnknownServiceResolver>,
    track_disposable_transients: bool,
    captive_dependency_check: bool,
    eager_singletons: bool,
    select_by_min_lifespan: bool,
    graph_split_threshold: Option<u32>,
    wait_timeout: Duration,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            default_reuse: Reuse::Transient,
            default_if_already_registered: IfAlreadyRegistered::AppendNotKeyed,
            factory_selector: None,
            dynamic_providers: Vec::new(),
            unknown_service_resolvers: Vec::new(),
            track_disposable_transients: false,
            captive_dependency_check: true,
            eager_singletons: false,
            select_by_min_lifespan: true,
            graph_split_threshold: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl Rules {
    // ===== Builders =====

    /// Reuse for registrations without an explicit one
    pub fn with_default_reuse(mut self, reuse: Reuse) -> Self {
        self.default_reuse = reuse;
        self
    }

    /// Conflict policy when a registration does not name one
    pub fn with_default_if_already_registered(mut self, policy: IfAlreadyRegistered) -> Self {
        self.default_if_already_registered = policy;
        self
    }

    /// Let `selector` choose among all candidates of unkeyed requests
    pub fn with_factory_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Request, &[(ServiceKey, FactoryRef)]) -> Option<FactoryRef> + Send + Sync + 'static,
    {
        self.factory_selector = Some(Arc::new(selector));
        self
    }

    pub fn with_dynamic_provider(mut self, provider: DynamicProvider) -> Self {
        self.dynamic_providers.push(provider);
        self
    }

    /// Consulted in order when nothing else matches
    pub fn with_unknown_service_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Request) -> Option<FactoryRef> + Send + Sync + 'static,
    {
        self.unknown_service_resolvers.push(Arc::new(resolver));
        self
    }

    /// Track disposable transients in the nearest reusing owner scope
    pub fn with_tracking_disposable_transients(mut self) -> Self {
        self.track_disposable_transients = true;
        self
    }

    pub fn without_captive_dependency_check(mut self) -> Self {
        self.captive_dependency_check = false;
        self
    }

    /// Create singletons while planning instead of on first execution
    pub fn with_eager_singletons(mut self) -> Self {
        self.eager_singletons = true;
        self
    }

    /// Stop preferring the single shortest-lived candidate on ambiguity
    pub fn without_min_lifespan_selection(mut self) -> Self {
        self.select_by_min_lifespan = false;
        self
    }

    /// Split plans with more than `threshold` dependencies into resolution calls
    pub fn with_graph_split_threshold(mut self, threshold: u32) -> Self {
        self.graph_split_threshold = Some(threshold);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    // ===== Accessors =====

    #[inline]
    pub fn default_reuse(&self) -> &Reuse {
        &self.default_reuse
    }

    #[inline]
    pub fn default_if_already_registered(&self) -> IfAlreadyRegistered {
        self.default_if_already_registered
    }

    #[inline]
    pub fn factory_selector(&self) -> Option<&FactorySelector> {
        self.factory_selector.as_ref()
    }

    #[inline]
    pub fn dynamic_providers(&self) -> &[DynamicProvider] {
        &self.dynamic_providers
    }

    #[inline]
    pub fn unknown_service_resolvers(&self) -> &[UnknownServiceResolver] {
        &self.unknown_service_resolvers
    }

    #[inline]
    pub fn tracks_disposable_transients(&self) -> bool {
        self.track_disposable_transients
    }

    #[inline]
    pub fn checks_captive_dependencies(&self) -> bool {
        self.captive_dependency_check
    }

    #[inline]
    pub fn eager_singletons(&self) -> bool {
        self.eager_singletons
    }

    #[inline]
    pub fn selects_by_min_lifespan(&self) -> bool {
        self.select_by_min_lifespan
    }

    #[inline]
    pub fn graph_split_threshold(&self) -> Option<u32> {
        self.graph_split_threshold
    }

    #[inline]
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Whether any provider contributes with the given flag
    pub(crate) fn has_providers(&self, flag: ProviderFlags) -> bool {
        self.dynamic_providers.iter().any(|p| p.flags.contains(flag))
    }
}

impl fmt::Debug for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rules")
            .field("default_reuse", &self.default_reuse)
            .field("default_if_already_registered", &self.default_if_already_registered)
            .field("factory_selector", &self.factory_selector.is_some())
            .field("dynamic_providers", &self.dynamic_providers.len())
            .field("unknown_service_resolvers", &self.unknown_service_resolvers.len())
            .field("track_disposable_transients", &self.track_disposable_transients)
            .field("captive_dependency_check", &self.captive_dependency_check)
            .field("eager_singletons", &self.eager_singletons)
            .field("select_by_min_lifespan", &self.select_by_min_lifespan)
            .field("graph_split_threshold", &self.graph_split_threshold)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rules = Rules::default();
        assert_eq!(rules.default_reuse(), &Reuse::Transient);
        assert_eq!(rules.default_if_already_registered(), IfAlreadyRegistered::AppendNotKeyed);
        assert!(rules.checks_captive_dependencies());
        assert!(!rules.tracks_disposable_transients());
        assert!(rules.selects_by_min_lifespan());
        assert!(rules.graph_split_threshold().is_none());
        assert_eq!(rules.wait_timeout(), DEFAULT_WAIT_TIMEOUT);
    }

    #[test]
    fn test_builders_do_not_mutate_original() {
        let base = Rules::default();
        let derived = base
            .clone()
            .with_default_reuse(Reuse::Singleton)
            .without_captive_dependency_check()
            .with_graph_split_threshold(8);

        assert_eq!(base.default_reuse(), &Reuse::Transient);
        assert_eq!(derived.default_reuse(), &Reuse::Singleton);
        assert!(!derived.checks_captive_dependencies());
        assert_eq!(derived.graph_split_threshold(), Some(8));
    }

    #[test]
    fn test_provider_flags() {
        let provider = DynamicProvider::new(|_, _| Vec::new()).with_flags(ProviderFlags::SERVICE | ProviderFlags::FALLBACK_ONLY);
        assert!(provider.flags().contains(ProviderFlags::FALLBACK_ONLY));
        assert!(!provider.flags().contains(ProviderFlags::DECORATOR));

        let rules = Rules::default().with_dynamic_provider(provider);
        assert!(rules.has_providers(ProviderFlags::SERVICE));
        assert!(!rules.has_providers(ProviderFlags::DECORATOR));
    }
}
