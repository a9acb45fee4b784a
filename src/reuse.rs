//! Reuse policies
//!
//! A [`Reuse`] decides which [`Scope`] (if any) stores the instance a factory
//! produces. Each policy has a lifespan rank used by the captive-dependency
//! check: a dependency must not have a shorter lifespan than its owner.

use crate::{DiError, Result, Scope, ServiceType};
use std::fmt;
use std::sync::Arc;

/// Lifespan of a transient service
pub const TRANSIENT_LIFESPAN: u32 = 0;
/// Lifespan of a scoped service
pub const SCOPED_LIFESPAN: u32 = 100;
/// Lifespan of a singleton service
pub const SINGLETON_LIFESPAN: u32 = 1000;

/// Service lifetime policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Reuse {
    /// New instance on every resolve, never stored
    #[default]
    Transient,
    /// One instance per open scope, optionally only the scope with the given name
    Scoped { name: Option<Arc<str>> },
    /// One instance per container, stored in the singleton scope
    Singleton,
    /// Scoped when a scope is open, singleton otherwise
    ScopedOrSingleton,
}

impl Reuse {
    /// Scoped to the nearest open scope
    #[inline]
    pub fn scoped() -> Self {
        Self::Scoped { name: None }
    }

    /// Scoped to the nearest open scope with the given name
    #[inline]
    pub fn scoped_to(name: impl Into<Arc<str>>) -> Self {
        Self::Scoped {
            name: Some(name.into()),
        }
    }

    /// Lifespan rank (higher lives longer)
    #[inline]
    pub fn lifespan(&self) -> u32 {
        match self {
            Self::Transient => TRANSIENT_LIFESPAN,
            Self::Scoped { .. } | Self::ScopedOrSingleton => SCOPED_LIFESPAN,
            Self::Singleton => SINGLETON_LIFESPAN,
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Where instances produced under this policy are stored
    pub fn target(&self) -> Option<ReuseTarget> {
        match self {
            Self::Transient => None,
            Self::Scoped { name } => Some(ReuseTarget::Current { name: name.clone() }),
            Self::Singleton => Some(ReuseTarget::Singleton),
            Self::ScopedOrSingleton => Some(ReuseTarget::CurrentOrSingleton),
        }
    }
}

impl fmt::Display for Reuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Scoped { name: None } => f.write_str("scoped"),
            Self::Scoped { name: Some(name) } => write!(f, "scoped({name:?})"),
            Self::Singleton => f.write_str("singleton"),
            Self::ScopedOrSingleton => f.write_str("scoped-or-singleton"),
        }
    }
}

/// Which scope backs a reused or tracked instance, decided at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReuseTarget {
    /// The container's singleton scope
    Singleton,
    /// The current scope, or its nearest ancestor with the given name
    Current { name: Option<Arc<str>> },
    /// The current scope if one is open, else the singleton scope
    CurrentOrSingleton,
}

impl ReuseTarget {
    /// Pick the scope for this target.
    ///
    /// `current` is the innermost open scope of the calling context.
    pub fn select(
        &self,
        singletons: &Arc<Scope>,
        current: Option<&Arc<Scope>>,
        service: &ServiceType,
    ) -> Result<Arc<Scope>> {
        match self {
            Self::Singleton => Ok(Arc::clone(singletons)),
            Self::CurrentOrSingleton => Ok(Arc::clone(current.unwrap_or(singletons))),
            Self::Current { name: None } => current.cloned().ok_or_else(|| DiError::NoCurrentScope {
                service: service.name().to_string(),
            }),
            Self::Current { name: Some(name) } => {
                let Some(current) = current else {
                    return Err(DiError::NoCurrentScope {
                        service: service.name().to_string(),
                    });
                };
                current
                    .find_named(name)
                    .ok_or_else(|| DiError::NoMatchingScopeName {
                        service: service.name().to_string(),
                        name: name.to_string(),
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use std::time::Duration;

    fn scope(name: Option<&str>, parent: Option<&Arc<Scope>>) -> Arc<Scope> {
        Scope::new(parent.cloned(), name.map(Into::into), Duration::from_secs(1))
    }

    #[test]
    fn test_lifespans_are_ordered() {
        assert!(Reuse::Transient.lifespan() < Reuse::scoped().lifespan());
        assert!(Reuse::scoped().lifespan() < Reuse::Singleton.lifespan());
        assert_eq!(Reuse::ScopedOrSingleton.lifespan(), Reuse::scoped_to("x").lifespan());
    }

    #[test]
    fn test_transient_has_no_target() {
        assert!(Reuse::Transient.target().is_none());
        assert_eq!(Reuse::Singleton.target(), Some(ReuseTarget::Singleton));
    }

    #[test]
    fn test_select_current_or_singleton() {
        let singletons = scope(None, None);
        let service = ServiceType::of::<u8>();
        let target = ReuseTarget::CurrentOrSingleton;

        let picked = target.select(&singletons, None, &service).unwrap();
        assert!(Arc::ptr_eq(&picked, &singletons));

        let request = scope(Some("request"), None);
        let picked = target.select(&singletons, Some(&request), &service).unwrap();
        assert!(Arc::ptr_eq(&picked, &request));
    }

    #[test]
    fn test_select_scoped_without_scope_fails() {
        let singletons = scope(None, None);
        let err = ReuseTarget::Current { name: None }
            .select(&singletons, None, &ServiceType::of::<u8>())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCurrentScope);
    }

    #[test]
    fn test_select_named_walks_parents() {
        let singletons = scope(None, None);
        let outer = scope(Some("session"), None);
        let inner = scope(Some("request"), Some(&outer));
        let service = ServiceType::of::<u8>();

        let picked = ReuseTarget::Current {
            name: Some("session".into()),
        }
        .select(&singletons, Some(&inner), &service)
        .unwrap();
        assert!(Arc::ptr_eq(&picked, &outer));

        let err = ReuseTarget::Current {
            name: Some("tenant".into()),
        }
        .select(&singletons, Some(&inner), &service)
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoMatchingScopeName);
    }
}
