mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use support::{database, init_logging, Counter, Database, UserService};
use weave::{Args, Binding, Container, DiError, Key, Lazy, Param};

struct A {
    b: Arc<B>,
}

struct B {
    a: Lazy<A>,
}

#[allow(dead_code)]
#[derive(Debug)]
struct Owner {
    helper: Arc<Helper>,
}

#[allow(dead_code)]
#[derive(Debug)]
struct Helper {
    owner: Arc<Owner>,
}

fn helper_binding() -> weave::BindingBuilder {
    Binding::of::<Helper>()
        .to_factory(|args| Ok(Helper { owner: args.get::<Owner>("owner")? }))
        .param(Param::of::<Owner>("owner"))
}

fn owner_cycle() -> Vec<Key> {
    vec![Key::of::<Owner>(), Key::of::<Helper>(), Key::of::<Owner>()]
}

trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

struct English;

impl Greeter for English {
    fn greet(&self, name: &str) -> String {
        format!("hello {}", name)
    }
}

#[test]
fn test_singleton_resolved_twice_is_identical() -> Result<()> {
    init_logging();
    let counter = Counter::default();
    let container = Container::new();
    container.bind(database(&counter))?;

    let first = container.resolve::<Database>()?;
    let second = container.resolve::<Database>()?;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn test_transient_constructs_every_time() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(database(&counter).transient())?;

    let first = container.resolve::<Database>()?;
    let second = container.resolve::<Database>()?;

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!((first.serial, second.serial), (1, 2));
    Ok(())
}

#[test]
fn test_cycle_reports_full_path() {
    let container = Container::new();
    container
        .bind(
            Binding::named::<u8>("A")
                .to_factory(|args| Ok(*args.get::<u8>("b")?))
                .param(Param::named("b").from_key("B")),
        )
        .unwrap();
    container
        .bind(
            Binding::named::<u8>("B")
                .to_factory(|args| Ok(*args.get::<u8>("a")?))
                .param(Param::named("a").from_key("A")),
        )
        .unwrap();

    let err = container.resolve_named::<u8>("A").unwrap_err();
    assert!(err.is_circular());
    assert_eq!(
        err.path().unwrap(),
        &[Key::named("A"), Key::named("B"), Key::named("A")]
    );
    assert!(err.to_string().contains("A -> B -> A"));
}

#[test]
fn test_typed_cycle_is_detected() {
    struct Left;
    struct Right;

    let container = Container::new();
    container
        .bind(
            Binding::of::<Left>()
                .to_factory(|_| Ok(Left))
                .param(Param::of::<Right>("right")),
        )
        .unwrap();
    container
        .bind(
            Binding::of::<Right>()
                .to_factory(|_| Ok(Right))
                .param(Param::of::<Left>("left")),
        )
        .unwrap();

    let err = container.resolve::<Left>().map(|_| ()).unwrap_err();
    assert_eq!(
        err.path().unwrap(),
        &[Key::of::<Left>(), Key::of::<Right>(), Key::of::<Left>()]
    );
}

#[test]
fn test_lazy_parameter_closes_cycle() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<A>()
            .to_factory(|args| Ok(A { b: args.get::<B>("b")? }))
            .param(Param::of::<B>("b")),
    )?;
    container.bind(
        Binding::of::<B>()
            .to_factory(|args| Ok(B { a: args.lazy::<A>("a")? }))
            .param(Param::lazy::<A>("a")),
    )?;

    assert!(container.validate().is_empty());

    let a = container.resolve::<A>()?;
    let through_lazy = a.b.a.get()?;
    assert!(Arc::ptr_eq(&a, &through_lazy));
    assert_eq!(a.b.a.key(), &Key::of::<A>());
    Ok(())
}

#[test]
fn test_forcing_lazy_inside_factory_reports_full_cycle() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<Owner>()
            .to_factory(|args| {
                let helper = args.lazy::<Helper>("helper")?.get()?;
                Ok(Owner { helper })
            })
            .param(Param::lazy::<Helper>("helper")),
    )?;
    container.bind(helper_binding())?;

    let err = container.resolve::<Owner>().unwrap_err();
    assert_eq!(err.path(), Some(owner_cycle().as_slice()));
    assert!(err.to_string().ends_with("Owner -> Helper -> Owner"));
    assert_eq!(container.stats().singletons, 0);
    Ok(())
}

#[tokio::test]
async fn test_forcing_lazy_inside_async_factory_reports_cycle() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<Owner>()
            .to_async_factory(|args: Args| async move {
                let helper = args.lazy::<Helper>("helper")?.get_async().await?;
                anyhow::Ok(Owner { helper })
            })
            .param(Param::lazy::<Helper>("helper")),
    )?;
    container.bind(helper_binding())?;

    let err = tokio::time::timeout(Duration::from_secs(5), container.resolve_async::<Owner>())
        .await?
        .unwrap_err();
    assert!(err.is_circular());
    assert_eq!(err.path(), Some(owner_cycle().as_slice()));
    Ok(())
}

#[tokio::test]
async fn test_async_factory_resolving_its_own_key_reports_cycle() -> Result<()> {
    let container = Container::new();
    let inner = container.clone();
    container.bind(Binding::of::<Database>().to_async_factory(move |_: Args| {
        let inner = inner.clone();
        async move {
            let again = inner.resolve_async::<Database>().await?;
            anyhow::Ok(Database {
                url: again.url.clone(),
                serial: again.serial + 1,
            })
        }
    }))?;

    let err = tokio::time::timeout(Duration::from_secs(5), container.resolve_async::<Database>())
        .await?
        .unwrap_err();
    assert_eq!(
        err.path(),
        Some(&[Key::of::<Database>(), Key::of::<Database>()][..])
    );
    Ok(())
}

#[test]
fn test_lazy_handle_detaches_from_dropped_container() -> Result<()> {
    let lazy = {
        let container = Container::new();
        container.bind(
            Binding::of::<A>()
                .to_factory(|args| Ok(A { b: args.get::<B>("b")? }))
                .param(Param::of::<B>("b")),
        )?;
        container.bind(
            Binding::of::<B>()
                .to_factory(|args| Ok(B { a: args.lazy::<A>("a")? }))
                .param(Param::lazy::<A>("a")),
        )?;
        let b = container.resolve::<B>()?;
        b.a.clone()
    };

    assert!(matches!(lazy.get(), Err(DiError::Detached { .. })));
    Ok(())
}

#[test]
fn test_class_binding_injects_declared_parameters() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(database(&counter))?;
    container.bind(Binding::of::<UserService>().to_class())?;

    let service = container.resolve::<UserService>()?;
    let db = container.resolve::<Database>()?;
    assert!(Arc::ptr_eq(&service.db, &db));
    Ok(())
}

#[test]
fn test_missing_dependency_names_parameter_and_path() {
    let container = Container::new();
    container
        .bind(Binding::of::<UserService>().to_class())
        .unwrap();

    let err = container.resolve::<UserService>().map(|_| ()).unwrap_err();
    match &err {
        DiError::DependencyNotFound {
            key,
            parameter,
            path,
        } => {
            assert_eq!(key, &Key::of::<Database>());
            assert_eq!(parameter.as_deref(), Some("db"));
            assert_eq!(path, &[Key::of::<UserService>(), Key::of::<Database>()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_parameter_sources_in_order() -> Result<()> {
    #[derive(Debug)]
    struct Server {
        port: u32,
        retries: u32,
        tag: Option<Arc<String>>,
    }

    let container = Container::new();
    container.bind(Binding::named::<u32>("port").to_value(8080))?;
    // A u32 bound by type must never satisfy a primitive parameter.
    container.bind(Binding::of::<u32>().to_value(1))?;
    container.bind(
        Binding::of::<Server>()
            .to_factory(|args| {
                Ok(Server {
                    port: *args.get::<u32>("port")?,
                    retries: *args.get::<u32>("retries")?,
                    tag: args.optional::<String>("tag")?,
                })
            })
            .params([
                Param::of::<u32>("port"),
                Param::of::<u32>("retries").default_value(3u32),
                Param::of::<String>("tag").optional(),
            ]),
    )?;

    let server = container.resolve::<Server>()?;
    assert_eq!(server.port, 8080);
    assert_eq!(server.retries, 3);
    assert!(server.tag.is_none());
    Ok(())
}

#[test]
fn test_unsized_trait_binding() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<dyn Greeter>().to_shared_factory(|_| Ok(Arc::new(English) as Arc<dyn Greeter>)),
    )?;

    let greeter = container.resolve::<dyn Greeter>()?;
    assert_eq!(greeter.greet("ada"), "hello ada");
    Ok(())
}

#[test]
fn test_failed_singleton_is_retried_on_next_call() -> Result<()> {
    let attempts = Counter::default();
    let container = Container::new();
    let seen = attempts.clone();
    container.bind(Binding::of::<Database>().to_factory(move |_| {
        let attempt = seen.bump();
        if attempt == 1 {
            anyhow::bail!("connection refused");
        }
        Ok(Database {
            url: "postgres://retry".into(),
            serial: attempt,
        })
    }))?;

    let err = container.resolve::<Database>().unwrap_err();
    assert!(matches!(err, DiError::Construction { .. }));
    assert!(err.to_string().contains("connection refused"));

    let db = container.resolve::<Database>()?;
    assert_eq!(db.serial, 2);
    assert_eq!(container.stats().failures, 1);
    Ok(())
}

#[test]
fn test_sync_resolve_of_async_binding_fails() {
    let container = Container::new();
    container
        .bind(Binding::of::<Database>().to_async_factory(|_: Args| async {
            anyhow::Ok(Database {
                url: "async".into(),
                serial: 0,
            })
        }))
        .unwrap();

    let err = container.resolve::<Database>().unwrap_err();
    assert!(matches!(err, DiError::AsyncResolution { .. }));
}

#[test]
fn test_async_binding_through_sync_dependency() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<Database>().to_async_factory(|_: Args| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            anyhow::Ok(Database {
                url: "async".into(),
                serial: 1,
            })
        }),
    )?;
    container.bind(Binding::of::<UserService>().to_class())?;

    // The class itself is synchronous but one of its dependencies is not.
    assert!(matches!(
        container.resolve::<UserService>().map(|_| ()),
        Err(DiError::AsyncResolution { .. })
    ));

    let service = tokio_test::block_on(container.resolve_async::<UserService>())?;
    assert_eq!(service.db.url, "async");
    Ok(())
}

#[test]
fn test_single_flight_across_threads() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    let seen = counter.clone();
    container.bind(Binding::of::<Database>().to_factory(move |_| {
        std::thread::sleep(Duration::from_millis(50));
        Ok(Database {
            url: "postgres://shared".into(),
            serial: seen.bump(),
        })
    }))?;

    let results: Vec<Arc<Database>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..10)
            .map(|_| s.spawn(|| container.resolve::<Database>()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("resolver thread panicked"))
            .collect::<Result<_, _>>()
    })?;

    assert_eq!(counter.get(), 1);
    assert!(results.iter().all(|db| Arc::ptr_eq(db, &results[0])));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_across_tasks() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    let seen = counter.clone();
    container.bind(Binding::of::<Database>().to_async_factory(move |_: Args| {
        let seen = seen.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            anyhow::Ok(Database {
                url: "postgres://shared".into(),
                serial: seen.bump(),
            })
        }
    }))?;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let container = container.clone();
            tokio::spawn(async move { container.resolve_async::<Database>().await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await??);
    }

    assert_eq!(counter.get(), 1);
    assert!(results.iter().all(|db| Arc::ptr_eq(db, &results[0])));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_failure_reaches_every_waiter() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    let seen = counter.clone();
    container.bind(Binding::of::<Database>().to_async_factory(move |_: Args| {
        let seen = seen.clone();
        async move {
            seen.bump();
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<Database, _>(anyhow::anyhow!("unreachable host"))
        }
    }))?;

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let container = container.clone();
            tokio::spawn(async move { container.resolve_async::<Database>().await })
        })
        .collect();

    for task in tasks {
        let err = task.await?.unwrap_err();
        assert!(err.to_string().contains("unreachable host"));
    }
    assert_eq!(counter.get(), 1);

    // The slot was cleared, so the next caller tries again.
    assert!(container.resolve_async::<Database>().await.is_err());
    assert_eq!(counter.get(), 2);
    Ok(())
}

#[test]
fn test_try_resolve_variants() -> Result<()> {
    let container = Container::new();
    assert!(container.try_resolve::<Database>()?.is_none());

    container.bind(Binding::of::<Database>().to_null().nullable())?;
    assert!(container.try_resolve::<Database>()?.is_none());
    assert!(container.resolve::<Database>().unwrap_err().is_not_found());
    assert!(container.is_registered::<Database>());
    Ok(())
}

#[test]
fn test_nullable_dependency_is_left_absent() -> Result<()> {
    struct Audit {
        sink: Option<Arc<String>>,
    }

    let container = Container::new();
    container.bind(Binding::named::<String>("sink").to_null().nullable())?;
    container.bind(
        Binding::of::<Audit>()
            .to_factory(|args| Ok(Audit { sink: args.optional::<String>("sink")? }))
            .param(Param::of::<String>("sink")),
    )?;

    assert!(container.resolve::<Audit>()?.sink.is_none());
    Ok(())
}
