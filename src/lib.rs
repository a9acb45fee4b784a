//! # scoped-injector - Concurrent Dependency Injection with Scoped Lifetimes
//!
//! A dependency injection runtime that resolves services through cached
//! construction plans, shares reused instances through lifetime-bound scopes
//! and keeps its registry as immutable snapshots swapped atomically.
//!
//! ## Features
//!
//! - **Snapshot registry** - registration publishes a new snapshot, readers never block
//! - **Reuse policies** - transient, singleton, scoped, named scopes, scoped-or-singleton
//! - **Keyed and appended registrations** - several implementations per service type
//! - **Decorators and wrappers** - ordered, conditional, keyed to a service or any service
//! - **Cached plans** - a resolved plan is reused until the registry changes
//! - **Safety checks** - recursive dependencies and captive dependencies are reported
//! - **Disposal** - ordered disposers run when a scope or the container is disposed
//! - **Observable** - optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use scoped_injector::Container;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! struct UserService {
//!     name: String,
//! }
//!
//! let container = Container::new();
//!
//! container.singleton(Database { url: "postgres://localhost".into() }).unwrap();
//! container.lazy(|| UserService { name: "users".into() }).unwrap();
//!
//! // Resolve - returns Arc<T>
//! let db = container.get::<Database>().unwrap();
//! let users = container.get::<UserService>().unwrap();
//! assert_eq!(db.url, "postgres://localhost");
//! assert_eq!(users.name, "users");
//! ```
//!
//! ## Registrations with dependencies
//!
//! ```rust
//! use scoped_injector::{Container, DelegateFactory, Registration, Reuse, ServiceInfo, ServiceType};
//!
//! struct Config {
//!     pool_size: usize,
//! }
//!
//! struct Pool {
//!     connections: usize,
//! }
//!
//! let container = Container::new();
//! container.singleton(Config { pool_size: 8 }).unwrap();
//!
//! let factory = DelegateFactory::with_dependencies(vec![ServiceInfo::of::<Config>()], |args| {
//!     let config = args.get::<Config>(0)?;
//!     Ok(Pool { connections: config.pool_size })
//! });
//! container
//!     .register(
//!         Registration::new(factory).with_reuse(Reuse::Singleton),
//!         ServiceType::of::<Pool>(),
//!         None,
//!         None,
//!     )
//!     .unwrap();
//!
//! assert_eq!(container.get::<Pool>().unwrap().connections, 8);
//! ```
//!
//! ## Scopes
//!
//! ```rust
//! use scoped_injector::{Container, Reuse};
//! use std::sync::Arc;
//!
//! struct AppConfig {
//!     name: String,
//! }
//!
//! struct RequestContext {
//!     id: u64,
//! }
//!
//! let container = Container::new();
//! container.singleton(AppConfig { name: "app".into() }).unwrap();
//! container.scoped(|| RequestContext { id: 7 }).unwrap();
//!
//! // Scoped services need an open scope
//! assert!(container.get::<RequestContext>().is_err());
//!
//! let request = container.open_scope(Some("request")).unwrap();
//! let a = request.get::<RequestContext>().unwrap();
//! let b = request.get::<RequestContext>().unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! assert_eq!(a.id, 7);
//!
//! // Singletons are visible from every scope
//! assert_eq!(request.get::<AppConfig>().unwrap().name, "app");
//!
//! // Disposing the scope disposes what it holds
//! request.dispose().unwrap();
//! ```

mod container;
mod error;
mod factory;
#[cfg(feature = "logging")]
pub mod logging;
mod plan;
mod provider;
mod registry;
mod request;
mod resolver;
mod reuse;
mod rules;
mod scope;
pub mod verified;

pub use container::*;
pub use error::*;
pub use factory::*;
pub use plan::{InvokeArgs, Plan, ResolutionCall, Thunk};
pub use provider::*;
pub use registry::IfAlreadyRegistered;
pub use request::*;
pub use reuse::*;
pub use rules::*;
pub use scope::*;

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::verified::{Service, ServiceModule, ServiceProvider};
    pub use crate::{
        Container, DiError, Factory, IfAlreadyRegistered, IfUnresolved, Injectable, Registration, Result,
        Reuse, Rules, Scope, ScopedContainer, ServiceInfo, ServiceKey, ServiceType, Setup,
    };
    pub use std::sync::Arc;
}
