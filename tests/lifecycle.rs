//! End-to-end reuse, scope and disposal behavior through the public API.

use parking_lot::Mutex;
use scoped_injector::{
    Container, DelegateFactory, DiError, Disposable, ErrorCode, Registration, Result, Reuse, Rules, ServiceInfo, Setup,
    ThreadLocalScopeContext,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn recording(log: &Log, name: &'static str, order: Option<i32>) -> Setup {
    let log = Arc::clone(log);
    let setup = Setup::new().with_disposer(move |_| {
        log.lock().push(name);
        Ok(())
    });
    match order {
        Some(order) => setup.with_disposal_order(order),
        None => setup,
    }
}

macro_rules! marker_services {
    ($($name:ident),+) => {
        $(struct $name;)+
    };
}

marker_services!(U1, O3, O1, U2, O2);

#[test]
fn test_singletons_dispose_ordered_first_then_reverse_creation() {
    let log: Log = Arc::default();
    let container = Container::new();

    container
        .register_service::<U1>(Registration::delegate(|| U1).with_reuse(Reuse::Singleton).with_setup(recording(&log, "u1", None)))
        .unwrap();
    container
        .register_service::<O3>(Registration::delegate(|| O3).with_reuse(Reuse::Singleton).with_setup(recording(&log, "o3", Some(3))))
        .unwrap();
    container
        .register_service::<O1>(Registration::delegate(|| O1).with_reuse(Reuse::Singleton).with_setup(recording(&log, "o1", Some(1))))
        .unwrap();
    container
        .register_service::<U2>(Registration::delegate(|| U2).with_reuse(Reuse::Singleton).with_setup(recording(&log, "u2", None)))
        .unwrap();
    container
        .register_service::<O2>(Registration::delegate(|| O2).with_reuse(Reuse::Singleton).with_setup(recording(&log, "o2", Some(2))))
        .unwrap();

    container.get::<U1>().unwrap();
    container.get::<O3>().unwrap();
    container.get::<O1>().unwrap();
    container.get::<U2>().unwrap();
    container.get::<O2>().unwrap();

    container.dispose().unwrap();
    assert_eq!(*log.lock(), vec!["o1", "o2", "o3", "u2", "u1"]);

    // Idempotent, and the container refuses further work
    container.dispose().unwrap();
    assert_eq!(log.lock().len(), 5);
    assert_eq!(container.get::<U1>().err().unwrap().code(), ErrorCode::ContainerDisposed);
}

#[test]
fn test_disposing_one_scope_leaves_the_other() {
    struct Session(u32);

    static NEXT: AtomicU32 = AtomicU32::new(0);
    let log: Log = Arc::default();

    let container = Container::new();
    container
        .register_service::<Session>(
            Registration::delegate(|| Session(NEXT.fetch_add(1, Ordering::SeqCst)))
                .with_reuse(Reuse::scoped())
                .with_setup(recording(&log, "session", None)),
        )
        .unwrap();

    let first = container.open_scope(None).unwrap();
    let second = container.open_scope(None).unwrap();
    let a = first.get::<Session>().unwrap();
    let b = second.get::<Session>().unwrap();
    assert_ne!(a.0, b.0);

    first.dispose().unwrap();
    assert_eq!(log.lock().len(), 1);

    let b_again = second.get::<Session>().unwrap();
    assert!(Arc::ptr_eq(&b, &b_again));

    drop(second);
    assert_eq!(log.lock().len(), 2);
}

struct Connection {
    closed: Arc<AtomicU32>,
}

impl Disposable for Connection {
    fn dispose(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Repository {
    _connection: Arc<Connection>,
}

fn register_repository(container: &Container, closed: &Arc<AtomicU32>) {
    let closed = Arc::clone(closed);
    container
        .register_service::<Connection>(
            Registration::delegate(move || Connection {
                closed: Arc::clone(&closed),
            })
            .with_reuse(Reuse::Transient)
            .with_setup(Setup::new().disposable::<Connection>()),
        )
        .unwrap();

    let factory = DelegateFactory::with_dependencies(vec![ServiceInfo::of::<Connection>()], |args| {
        Ok(Repository {
            _connection: args.get::<Connection>(0)?,
        })
    });
    container
        .register_service::<Repository>(Registration::new(factory).with_reuse(Reuse::Singleton))
        .unwrap();
}

#[test]
fn test_untracked_disposable_transient_in_singleton_is_captive() {
    let closed = Arc::new(AtomicU32::new(0));
    let container = Container::new();
    register_repository(&container, &closed);

    let err = container.get::<Repository>().err().unwrap();
    assert_eq!(err.code(), ErrorCode::CaptiveDependency);
    assert!(err.to_string().contains("Connection"));
}

#[test]
fn test_tracked_disposable_transient_is_disposed_once() {
    let closed = Arc::new(AtomicU32::new(0));
    let container = Container::with_rules(Rules::default().with_tracking_disposable_transients());
    register_repository(&container, &closed);

    let first = container.get::<Repository>().unwrap();
    let second = container.get::<Repository>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    container.dispose().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    container.dispose().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_singleton_probe_runs_once() {
    struct Expensive;

    static CREATED: AtomicU32 = AtomicU32::new(0);
    const THREADS: usize = 8;

    let container = Container::new();
    container
        .lazy(|| {
            CREATED.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(5));
            Expensive
        })
        .unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let container = container.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                container.get::<Expensive>().map_err(|err| err.to_string())
            })
        })
        .collect();

    let instances: Vec<Arc<Expensive>> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    assert!(instances.iter().all(|instance| Arc::ptr_eq(instance, &instances[0])));
}

#[test]
fn test_named_scope_reuse_across_nested_scopes() {
    struct Transaction(u32);

    static NEXT: AtomicU32 = AtomicU32::new(0);

    let container = Container::new();
    container
        .register_service::<Transaction>(
            Registration::delegate(|| Transaction(NEXT.fetch_add(1, Ordering::SeqCst))).with_reuse(Reuse::scoped_to("unit-of-work")),
        )
        .unwrap();

    // No scope with that name is open yet
    let plain = container.open_scope(None).unwrap();
    assert_eq!(
        plain.get::<Transaction>().err().unwrap().code(),
        ErrorCode::NoMatchingScopeName
    );

    let unit = plain.open_scope(Some("unit-of-work")).unwrap();
    let inner = unit.open_scope(None).unwrap();
    let a = unit.get::<Transaction>().unwrap();
    let b = inner.get::<Transaction>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_ambient_scope_follows_open_and_release() {
    struct Request;

    let container = Container::with_scope_context(Rules::default(), Arc::new(ThreadLocalScopeContext::new()));
    container.scoped(|| Request).unwrap();

    assert!(container.current_scope().is_none());
    assert_eq!(container.get::<Request>().err().unwrap().code(), ErrorCode::NoCurrentScope);

    let scoped = container.open_scope(Some("request")).unwrap();
    assert_eq!(container.current_scope().unwrap().id(), scoped.scope().id());

    // The plain container handle now resolves in the ambient scope
    let a = container.get::<Request>().unwrap();
    let b = scoped.get::<Request>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    drop(scoped);
    assert!(container.current_scope().is_none());
}

#[test]
fn test_disposer_failures_do_not_stop_disposal() {
    struct Flaky;
    struct Solid;

    let log: Log = Arc::default();
    let container = Container::new();
    container
        .register_service::<Flaky>(
            Registration::instance(Flaky).with_setup(
                Setup::new().with_disposer(|_| Err(DiError::disposer_failed::<Flaky>("socket already closed"))),
            ),
        )
        .unwrap();
    container
        .register_service::<Solid>(Registration::instance(Solid).with_setup(recording(&log, "solid", None)))
        .unwrap();

    container.get::<Solid>().unwrap();
    container.get::<Flaky>().unwrap();

    container.dispose().unwrap();
    assert_eq!(*log.lock(), vec!["solid"]);
    assert!(container.is_disposed());
}
