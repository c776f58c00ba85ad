mod support;

use std::sync::Arc;

use anyhow::Result;
use serial_test::serial;
use support::{database, request_ctx, Counter, Database, RequestCtx};
use weave::{ActiveContext, Container, ContainerConfig, DiError};

#[test]
#[serial]
fn test_free_resolve_without_container_fails() {
    weave::clear_default();
    let err = weave::resolve::<Database>().unwrap_err();
    assert!(matches!(err, DiError::NoActiveContainer));
}

#[test]
#[serial]
fn test_default_container_is_last_resort() -> Result<()> {
    let counter = Counter::default();
    let fallback = Container::with_config(ContainerConfig::named("fallback"));
    fallback.bind(database(&counter))?;
    assert!(weave::install_default(fallback.clone()).is_none());

    let from_default = weave::resolve::<Database>()?;
    assert!(Arc::ptr_eq(&from_default, &fallback.resolve::<Database>()?));

    // An activated container takes precedence over the default.
    let preferred = Container::new();
    preferred.bind(database(&Counter::default()))?;
    {
        let _active = preferred.activate();
        assert_eq!(ActiveContext::get_active(None).map(|c| c.id()), Some(preferred.id()));
        let from_active = weave::resolve::<Database>()?;
        assert!(!Arc::ptr_eq(&from_active, &from_default));
    }

    let previous = weave::clear_default();
    assert_eq!(previous.map(|c| c.id()), Some(fallback.id()));
    assert!(weave::default_container().is_none());
    Ok(())
}

#[test]
fn test_scope_guard_activates_its_container() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let guard = container.enter_scope("request");
    let via_free_fn = weave::resolve::<RequestCtx>()?;
    let via_container = container.resolve::<RequestCtx>()?;
    assert!(Arc::ptr_eq(&via_free_fn, &via_container));
    assert_eq!(ActiveContext::depth(), 1);
    guard.exit()?;
    assert_eq!(ActiveContext::depth(), 0);
    Ok(())
}

#[test]
fn test_scopes_of_other_containers_are_ignored() -> Result<()> {
    let counter = Counter::default();
    let first = Container::new();
    let second = Container::new();
    first.bind(request_ctx(&counter))?;
    second.bind(request_ctx(&counter))?;

    let guard = first.enter_scope("request");
    assert!(first.resolve::<RequestCtx>().is_ok());
    assert!(second.resolve::<RequestCtx>().unwrap_err().is_scope_error());
    guard.exit()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_scope_is_invisible_to_other_tasks() -> Result<()> {
    let counter = Counter::default();
    let container = Container::new();
    container.bind(request_ctx(&counter))?;

    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let owner = container.clone();
    let holder = tokio::spawn(async move {
        let inner = owner.clone();
        owner
            .scope_async("request", async move {
                inner.resolve_async::<RequestCtx>().await?;
                let _ = entered_tx.send(());
                let _ = done_rx.await;
                anyhow::Ok(())
            })
            .await
    });

    entered_rx.await?;
    let outsider = container.clone();
    let err = tokio::spawn(async move { outsider.resolve_async::<RequestCtx>().await })
        .await?
        .unwrap_err();
    assert!(err.is_scope_error());

    let _ = done_tx.send(());
    holder.await???;
    assert_eq!(counter.get(), 1);
    Ok(())
}
