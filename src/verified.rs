//! Services that declare their dependencies in their type.
//!
//! A [`Service`] names what it needs through `Dependencies`; [`ServiceProvider`]
//! registers it as a delegate factory whose dependencies are planned through
//! the normal request chain, so recursion and captive checks apply to them
//! like to any other registration.
//!
//! # Example
//!
//! ```rust
//! use scoped_injector::verified::{Service, ServiceProvider};
//! use scoped_injector::Container;
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! impl Service for Database {
//!     type Dependencies = ();
//!
//!     fn create(_deps: Self::Dependencies) -> Self {
//!         Database { url: "postgres://localhost".into() }
//!     }
//! }
//!
//! struct UserRepository {
//!     db: Arc<Database>,
//! }
//!
//! impl Service for UserRepository {
//!     type Dependencies = Arc<Database>;
//!
//!     fn create(db: Self::Dependencies) -> Self {
//!         UserRepository { db }
//!     }
//! }
//!
//! let container = Container::new();
//! container.provide::<Database>().unwrap();
//! container.provide::<UserRepository>().unwrap();
//!
//! let repo = container.get::<UserRepository>().unwrap();
//! assert_eq!(repo.db.url, "postgres://localhost");
//! ```

use crate::{
    Container, DelegateFactory, IfAlreadyRegistered, Injectable, InvokeArgs, Registration, Result, Reuse,
    ServiceInfo, ServiceType,
};
use std::sync::Arc;

// =============================================================================
// Service Trait
// =============================================================================

/// A service that declares its dependencies at compile time.
///
/// # Supported Dependency Types
///
/// - `()` - No dependencies
/// - `Arc<T>` - Single required dependency
/// - `Option<Arc<T>>` - Optional dependency, `None` when nothing is registered
/// - `(Arc<A>, Option<Arc<B>>, ...)` - Multiple dependencies (tuples up to 12)
pub trait Service: Injectable + Sized {
    /// The dependencies required to create this service.
    type Dependencies: Resolvable;

    /// Create a new instance given the resolved dependencies.
    fn create(deps: Self::Dependencies) -> Self;
}

// =============================================================================
// Resolvable
// =============================================================================

/// A dependency shape that can be declared up front and rebuilt from
/// resolved arguments.
pub trait Resolvable: Sized {
    /// The service infos planned as arguments, in argument order
    fn dependencies() -> Vec<ServiceInfo>;

    /// Rebuild the value from the arguments resolved for [`Self::dependencies`]
    fn from_args(args: &InvokeArgs<'_>) -> Result<Self>;

    /// Resolve the value straight from a container.
    fn resolve(container: &Container) -> Result<Self>;
}

impl Resolvable for () {
    #[inline]
    fn dependencies() -> Vec<ServiceInfo> {
        Vec::new()
    }

    #[inline]
    fn from_args(_args: &InvokeArgs<'_>) -> Result<Self> {
        Ok(())
    }

    #[inline]
    fn resolve(_container: &Container) -> Result<Self> {
        Ok(())
    }
}

/// A single dependency slot: a required or an optional service.
pub trait Dependency: Sized {
    /// The service info planned for this slot
    fn info() -> ServiceInfo;

    fn from_arg(args: &InvokeArgs<'_>, index: usize) -> Result<Self>;

    fn resolve_from(container: &Container) -> Result<Self>;
}

impl<T: Injectable> Dependency for Arc<T> {
    fn info() -> ServiceInfo {
        ServiceInfo::of::<T>()
    }

    #[inline]
    fn from_arg(args: &InvokeArgs<'_>, index: usize) -> Result<Self> {
        args.get::<T>(index)
    }

    #[inline]
    fn resolve_from(container: &Container) -> Result<Self> {
        container.get::<T>()
    }
}

impl<T: Injectable> Dependency for Option<Arc<T>> {
    fn info() -> ServiceInfo {
        ServiceInfo::of::<T>().optional()
    }

    #[inline]
    fn from_arg(args: &InvokeArgs<'_>, index: usize) -> Result<Self> {
        args.optional::<T>(index)
    }

    #[inline]
    fn resolve_from(container: &Container) -> Result<Self> {
        container.try_get::<T>()
    }
}

impl<T: Injectable> Resolvable for Arc<T> {
    fn dependencies() -> Vec<ServiceInfo> {
        vec![<Self as Dependency>::info()]
    }

    #[inline]
    fn from_args(args: &InvokeArgs<'_>) -> Result<Self> {
        Self::from_arg(args, 0)
    }

    #[inline]
    fn resolve(container: &Container) -> Result<Self> {
        Self::resolve_from(container)
    }
}

impl<T: Injectable> Resolvable for Option<Arc<T>> {
    fn dependencies() -> Vec<ServiceInfo> {
        vec![<Self as Dependency>::info()]
    }

    #[inline]
    fn from_args(args: &InvokeArgs<'_>) -> Result<Self> {
        Self::from_arg(args, 0)
    }

    #[inline]
    fn resolve(container: &Container) -> Result<Self> {
        Self::resolve_from(container)
    }
}

// Tuples mix required and optional slots freely
macro_rules! impl_resolvable_tuple {
    ($($T:ident),+) => {
        impl<$($T: Dependency),+> Resolvable for ($($T,)+) {
            fn dependencies() -> Vec<ServiceInfo> {
                vec![$($T::info()),+]
            }

            #[allow(unused_assignments)]
            fn from_args(args: &InvokeArgs<'_>) -> Result<Self> {
                let mut index = 0;
                Ok(($(
                    {
                        let value = $T::from_arg(args, index)?;
                        index += 1;
                        value
                    },
                )+))
            }

            fn resolve(container: &Container) -> Result<Self> {
                Ok(($($T::resolve_from(container)?,)+))
            }
        }
    };
}

impl_resolvable_tuple!(A, B);
impl_resolvable_tuple!(A, B, C);
impl_resolvable_tuple!(A, B, C, D);
impl_resolvable_tuple!(A, B, C, D, E);
impl_resolvable_tuple!(A, B, C, D, E, F);
impl_resolvable_tuple!(A, B, C, D, E, F, G);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H, I);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H, I, J);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H, I, J, K);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H, I, J, K, L);

// =============================================================================
// ServiceProvider - Auto-registration
// =============================================================================

/// Registration of [`Service`] types on a container.
///
/// Every method replaces an existing default registration of `T`.
pub trait ServiceProvider {
    /// Register `T` as a singleton created on first use.
    fn provide<T: Service>(&self) -> Result<()>;

    /// Register `T` as transient: a new instance on every resolution.
    fn provide_transient<T: Service>(&self) -> Result<()>;

    /// Register `T` as shared within each open scope.
    fn provide_scoped<T: Service>(&self) -> Result<()>;

    /// Register `T` with an explicit reuse.
    ///
    /// # Example
    ///
    /// ```rust
    /// use scoped_injector::{Container, Reuse};
    /// use scoped_injector::verified::{Service, ServiceProvider};
    ///
    /// struct Session;
    ///
    /// impl Service for Session {
    ///     type Dependencies = ();
    ///     fn create(_: ()) -> Self { Session }
    /// }
    ///
    /// let container = Container::new();
    /// container.provide_with::<Session>(Reuse::scoped_to("request")).unwrap();
    ///
    /// let request = container.open_scope(Some("request")).unwrap();
    /// let a = request.get::<Session>().unwrap();
    /// let b = request.get::<Session>().unwrap();
    /// assert!(std::sync::Arc::ptr_eq(&a, &b));
    /// ```
    fn provide_with<T: Service>(&self, reuse: Reuse) -> Result<()>;
}

impl ServiceProvider for Container {
    #[inline]
    fn provide<T: Service>(&self) -> Result<()> {
        self.provide_with::<T>(Reuse::Singleton)
    }

    #[inline]
    fn provide_transient<T: Service>(&self) -> Result<()> {
        self.provide_with::<T>(Reuse::Transient)
    }

    #[inline]
    fn provide_scoped<T: Service>(&self) -> Result<()> {
        self.provide_with::<T>(Reuse::scoped())
    }

    fn provide_with<T: Service>(&self, reuse: Reuse) -> Result<()> {
        let factory = DelegateFactory::with_dependencies(T::Dependencies::dependencies(), |args| {
            T::Dependencies::from_args(args).map(T::create)
        });
        self.register(
            Registration::new(factory).with_reuse(reuse),
            ServiceType::of::<T>(),
            None,
            Some(IfAlreadyRegistered::Replace),
        )
        .map(|_| ())
    }
}

// =============================================================================
// ServiceModule - Group related services
// =============================================================================

/// A module that groups related service registrations.
///
/// # Example
///
/// ```rust
/// use scoped_injector::{Container, Result};
/// use scoped_injector::verified::{Service, ServiceModule, ServiceProvider};
///
/// struct Database;
///
/// impl Service for Database {
///     type Dependencies = ();
///     fn create(_: ()) -> Self { Database }
/// }
///
/// struct Cache;
///
/// impl Service for Cache {
///     type Dependencies = ();
///     fn create(_: ()) -> Self { Cache }
/// }
///
/// struct DataModule;
///
/// impl ServiceModule for DataModule {
///     fn register(container: &Container) -> Result<()> {
///         container.provide::<Database>()?;
///         container.provide_transient::<Cache>()
///     }
/// }
///
/// let container = Container::new();
/// DataModule::register(&container).unwrap();
///
/// assert!(container.contains::<Database>());
/// assert!(container.contains::<Cache>());
/// ```
pub trait ServiceModule {
    /// Register all services in this module.
    fn register(container: &Container) -> Result<()>;
}
