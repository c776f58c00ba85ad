mod support;

use std::sync::{Arc, Barrier};

use anyhow::Result;
use support::{request_ctx, Counter, ReleaseLog, RequestCtx};
use weave::{ActiveContext, Args, AsyncResource, Binding, Container, DiError, Key, Resource};

#[derive(Debug)]
struct Handle(&'static str);

fn tracked(name: &'static str, log: &ReleaseLog, fail: bool) -> weave::BindingBuilder {
    let log = log.clone();
    Binding::named::<Handle>(name)
        .to_resource(move |_| {
            let log = log.clone();
            Ok(Resource::new(Handle(name), move |handle| {
                log.push(handle.0);
                if fail {
                    anyhow::bail!("{} refused to close", handle.0);
                }
                Ok(())
            }))
        })
        .scoped("request")
}

#[test]
fn test_successive_scopes_are_isolated() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let (first, again) = container.scope("request", |_| {
        let a = container.resolve::<RequestCtx>()?;
        let b = container.resolve::<RequestCtx>()?;
        Ok::<_, DiError>((a, b))
    })??;
    let second = container.scope("request", |_| container.resolve::<RequestCtx>())??;

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!((first.serial, second.serial), (1, 2));
    Ok(())
}

#[test]
fn test_scoped_key_without_scope_is_an_error() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let err = container.resolve::<RequestCtx>().unwrap_err();
    assert!(err.is_scope_error());
    assert!(err.to_string().contains("'request'"));

    // A scope with another name does not satisfy the binding either.
    let err = container
        .scope("job", |_| container.resolve::<RequestCtx>())?
        .unwrap_err();
    assert!(matches!(err, DiError::Scope { ref scope, .. } if scope == "request"));
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn test_nested_scopes_resolve_innermost_match() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let outer = container.enter_scope("request");
    let from_outer = container.resolve::<RequestCtx>()?;
    {
        let inner = container.enter_scope("request");
        let from_inner = container.resolve::<RequestCtx>()?;
        assert!(!Arc::ptr_eq(&from_outer, &from_inner));
        assert_eq!(inner.context().instance_count(), 1);
        inner.exit()?;
    }
    assert!(Arc::ptr_eq(&from_outer, &container.resolve::<RequestCtx>()?));
    outer.exit()?;
    Ok(())
}

#[test]
fn test_resources_release_in_reverse_order() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    container.bind(tracked("h1", &log, false))?;
    container.bind(tracked("h2", &log, false))?;

    container.scope("request", |_| -> Result<()> {
        container.resolve_named::<Handle>("h1")?;
        container.resolve_named::<Handle>("h2")?;
        Ok(())
    })??;

    assert_eq!(log.entries(), vec!["h2", "h1"]);
    Ok(())
}

#[test]
fn test_failing_finalizer_does_not_skip_the_rest() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    container.bind(tracked("h1", &log, false))?;
    container.bind(tracked("h2", &log, true))?;

    let err = container
        .scope("request", |_| -> Result<()> {
            container.resolve_named::<Handle>("h1")?;
            container.resolve_named::<Handle>("h2")?;
            Ok(())
        })
        .unwrap_err();

    assert_eq!(log.entries(), vec!["h2", "h1"]);
    match err {
        DiError::ResourceCleanup { scope, failures } => {
            assert_eq!(scope, "request");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].key, Key::named("h2"));
            assert!(failures[0].message.contains("refused to close"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn test_dropped_guard_still_releases() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    container.bind(tracked("h1", &log, false))?;

    {
        let _guard = container.enter_scope("request");
        container.resolve_named::<Handle>("h1")?;
    }
    assert_eq!(log.entries(), vec!["h1"]);
    assert_eq!(ActiveContext::depth(), 0);
    Ok(())
}

#[test]
fn test_transient_resource_belongs_to_innermost_scope() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    let sink = log.clone();
    container.bind(
        Binding::of::<Handle>()
            .to_resource(move |_| {
                let sink = sink.clone();
                Ok(Resource::new(Handle("temp"), move |_| {
                    sink.push("temp");
                    Ok(())
                }))
            })
            .transient(),
    )?;

    let job = container.enter_scope("job");
    container.resolve::<Handle>()?;
    container.resolve::<Handle>()?;
    assert!(log.entries().is_empty());
    job.exit()?;
    assert_eq!(log.entries(), vec!["temp", "temp"]);
    Ok(())
}

#[test]
fn test_resolve_in_explicit_scope() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let guard = container.enter_scope("request");
    let scope = Arc::clone(guard.context());
    let expected = container.resolve::<RequestCtx>()?;

    // From another thread the context stack is empty, but the scope can be passed in.
    let resolved = std::thread::scope(|s| {
        s.spawn(|| container.resolve_in::<RequestCtx>(&Key::of::<RequestCtx>(), &scope))
            .join()
            .expect("resolver thread panicked")
    })?;
    assert!(Arc::ptr_eq(&expected, &resolved));

    guard.exit()?;
    assert!(container
        .resolve_in::<RequestCtx>(&Key::of::<RequestCtx>(), &scope)
        .unwrap_err()
        .is_scope_error());
    Ok(())
}

#[test]
fn test_resource_finished_after_scope_exit_is_released() -> Result<()> {
    let log = ReleaseLog::default();
    let gate = Arc::new(Barrier::new(2));
    let container = Container::new();
    let (sink, factory_gate) = (log.clone(), Arc::clone(&gate));
    container.bind(
        Binding::of::<Handle>()
            .to_resource(move |_| {
                factory_gate.wait();
                factory_gate.wait();
                let sink = sink.clone();
                Ok(Resource::new(Handle("late"), move |handle| {
                    sink.push(handle.0);
                    Ok(())
                }))
            })
            .scoped("request"),
    )?;

    let guard = container.enter_scope("request");
    let scope = Arc::clone(guard.context());
    let resolved = std::thread::scope(|s| {
        let worker = s.spawn(|| container.resolve_in::<Handle>(&Key::of::<Handle>(), &scope));
        gate.wait();
        let exited = guard.exit();
        gate.wait();
        exited.map(|_| worker.join().expect("resolver thread panicked"))
    })?;

    let err = resolved.unwrap_err();
    assert!(matches!(err, DiError::Scope { ref scope, .. } if scope == "request"));
    assert_eq!(log.entries(), vec!["late"]);
    assert_eq!(scope.instance_count(), 0);
    Ok(())
}

#[test]
fn test_resource_after_shutdown_is_refused() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    let sink = log.clone();
    container.bind(Binding::of::<Handle>().to_resource(move |_| {
        let sink = sink.clone();
        Ok(Resource::new(Handle("pool"), move |handle| {
            sink.push(handle.0);
            Ok(())
        }))
    }))?;

    container.shutdown()?;
    let err = container.resolve::<Handle>().unwrap_err();
    assert!(err.is_scope_error());
    assert_eq!(log.entries(), vec!["pool"]);
    Ok(())
}

#[test]
fn test_clear_scope_drops_cached_instances() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let guard = container.enter_scope("request");
    let before = container.resolve::<RequestCtx>()?;
    assert_eq!(container.clear_scope("job"), 0);
    assert_eq!(container.clear_scope("request"), 1);
    let after = container.resolve::<RequestCtx>()?;
    assert!(!Arc::ptr_eq(&before, &after));
    guard.exit()?;
    Ok(())
}

#[tokio::test]
async fn test_async_scope_runs_async_finalizers() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    let sink = log.clone();
    container.bind(
        Binding::of::<Handle>()
            .to_async_resource(move |_: Args| {
                let sink = sink.clone();
                async move {
                    anyhow::Ok(AsyncResource::new(Handle("conn"), move |handle| async move {
                        tokio::task::yield_now().await;
                        sink.push(handle.0);
                        anyhow::Ok(())
                    }))
                }
            })
            .scoped("task"),
    )?;

    let name = container
        .scope_async("task", async {
            let handle = weave::resolve_async::<Handle>().await?;
            anyhow::Ok(handle.0)
        })
        .await??;

    assert_eq!(name, "conn");
    assert_eq!(log.entries(), vec!["conn"]);
    Ok(())
}

#[tokio::test]
async fn test_sync_exit_reports_async_finalizer() -> Result<()> {
    let container = Container::new();
    container.bind(
        Binding::of::<Handle>()
            .to_async_resource(|_: Args| async {
                anyhow::Ok(AsyncResource::new(Handle("conn"), |_| async { anyhow::Ok(()) }))
            })
            .scoped("request"),
    )?;

    let guard = container.enter_scope("request");
    container.resolve_async::<Handle>().await?;
    let err = guard.exit().unwrap_err();
    assert!(err.to_string().contains("exit_async"));
    Ok(())
}

#[tokio::test]
async fn test_exit_async_awaits_finalizers() -> Result<()> {
    let log = ReleaseLog::default();
    let container = Container::new();
    let sink = log.clone();
    container.bind(
        Binding::of::<Handle>()
            .to_async_resource(move |_: Args| {
                let sink = sink.clone();
                async move {
                    anyhow::Ok(AsyncResource::new(Handle("conn"), move |_| async move {
                        sink.push("conn");
                        anyhow::Ok(())
                    }))
                }
            })
            .scoped("request"),
    )?;

    let guard = container.enter_scope("request");
    container.resolve_async::<Handle>().await?;
    guard.exit_async().await?;
    assert_eq!(log.entries(), vec!["conn"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_task_scopes_are_isolated() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let container = container.clone();
            tokio::spawn(async move {
                let inner = container.clone();
                container
                    .scope_async("request", async move {
                        let a = inner.resolve_async::<RequestCtx>().await?;
                        tokio::task::yield_now().await;
                        let b = inner.resolve_async::<RequestCtx>().await?;
                        assert!(Arc::ptr_eq(&a, &b));
                        anyhow::Ok(a.serial)
                    })
                    .await
            })
        })
        .collect();

    let mut serials = Vec::new();
    for task in tasks {
        serials.push(task.await???);
    }
    serials.sort_unstable();
    assert_eq!(serials, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_carries_scope_into_spawned_task() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let guard = container.enter_scope("request");
    let here = container.resolve::<RequestCtx>()?;

    let snapshot = ActiveContext::capture();
    let worker = container.clone();
    let there = tokio::spawn(snapshot.scope(async move { worker.resolve_async::<RequestCtx>().await }))
        .await??;

    assert!(Arc::ptr_eq(&here, &there));
    guard.exit()?;
    Ok(())
}
