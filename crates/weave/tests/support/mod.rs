#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use weave::{Args, Binding, BindingBuilder, Injectable, Param};

pub fn init_logging() {
    let _ = common::init_structured_logging(
        common::LoggingConfig::default().with_level(tracing::Level::DEBUG),
    );
}

#[derive(Debug)]
pub struct Database {
    pub url: String,
    pub serial: usize,
}

#[derive(Debug)]
pub struct RequestCtx {
    pub serial: usize,
}

pub struct UserService {
    pub db: Arc<Database>,
}

impl Injectable for UserService {
    fn parameters() -> Vec<Param> {
        vec![Param::of::<Database>("db")]
    }

    fn construct(args: &Args) -> anyhow::Result<Self> {
        Ok(Self {
            db: args.get::<Database>("db")?,
        })
    }
}

/// Counts constructor calls.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ordered record of finalizer calls.
#[derive(Clone, Default)]
pub struct ReleaseLog(Arc<Mutex<Vec<String>>>);

impl ReleaseLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

pub fn database(counter: &Counter) -> BindingBuilder {
    let counter = counter.clone();
    Binding::of::<Database>().to_factory(move |_| {
        Ok(Database {
            url: "postgres://localhost/app".to_string(),
            serial: counter.bump(),
        })
    })
}

pub fn request_ctx(counter: &Counter) -> BindingBuilder {
    let counter = counter.clone();
    Binding::of::<RequestCtx>()
        .to_factory(move |_| {
            Ok(RequestCtx {
                serial: counter.bump(),
            })
        })
        .scoped("request")
}
