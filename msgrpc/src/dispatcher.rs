use std::{
    backtrace::Backtrace,
    cell::RefCell,
    fmt::Write,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Once},
};

use futures_util::{FutureExt, future::BoxFuture};

use crate::{Request, Response, Router, StatusCode, procedure::Procedure};

type Chain = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// Handle to the rest of a dispatch chain, passed to hooks.
#[derive(Clone)]
pub struct Next(Chain);

impl Next {
    pub async fn run(self, request: Request) -> Response {
        (self.0)(request).await
    }
}

/// Server-side request executor.
///
/// Every request yields exactly one response: 400 when `.method` is
/// missing, 404 when it names nothing in the table, 500 when the
/// procedure returns an error or panics, 200 otherwise. The dispatcher
/// keeps no per-request state and is cheap to clone into worker tasks.
///
/// The `.traceback` of a panic carries the backtrace taken where the
/// procedure panicked. For a returned error it lists the error's source
/// chain followed by the backtrace of the dispatch site, since the error
/// value records none of its own.
#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
    chain: Chain,
}

impl Dispatcher {
    #[must_use]
    pub fn new(router: Router) -> Self {
        install_panic_trace();
        let router = Arc::new(router);
        let chain: Chain = {
            let router = router.clone();
            Arc::new(move |request| {
                let router = router.clone();
                async move { execute(&router, request).await }.boxed()
            })
        };
        Self { router, chain }
    }

    /// Wraps the current chain with `hook`. Hooks added later run first and
    /// decide whether, and with what request, the inner chain runs.
    #[must_use]
    pub fn with_hook<H, Fut>(mut self, hook: H) -> Self
    where
        H: Fn(Request, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let next = Next(self.chain.clone());
        self.chain = Arc::new(move |request| hook(request, next.clone()).boxed());
        self
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        (self.chain)(request).await
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> {
        self.router.procedures().map(AsRef::as_ref)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

async fn execute(router: &Router, request: Request) -> Response {
    let Some(name) = request.method() else {
        tracing::debug!("reject request without .method");
        return Response::error(StatusCode::BAD_REQUEST, "Missing .method");
    };

    let Some(method) = router.get(name) else {
        tracing::debug!("reject request for unknown method {name}");
        return Response::error(StatusCode::NOT_FOUND, format!(".method {name} not found"));
    };

    let name = method.procedure.name.as_str();
    let args = method.procedure.extract(request.params);
    tracing::trace!("execute {name}");
    match AssertUnwindSafe((method.handler)(args)).catch_unwind().await {
        Ok(Ok(result)) => Response::ok(result),
        Ok(Err(err)) => {
            tracing::warn!("exception in call of {name}: {err}");
            Response::failure(
                format!("Exception in call of {name}: {err}"),
                format_error(err.as_ref()),
            )
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!("panic in call of {name}: {reason}");
            Response::failure(
                format!("Exception in call of {name}: {reason}"),
                format!("panicked: {reason}\n{}", take_panic_trace()),
            )
        }
    }
}

fn format_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    let mut out = format!("Error: {err}");
    let mut source = err.source();
    if source.is_some() {
        out.push_str("\n\nCaused by:");
    }
    let mut index = 0;
    while let Some(cause) = source {
        let _ = write!(out, "\n    {index}: {cause}");
        index += 1;
        source = cause.source();
    }
    let _ = write!(out, "\n\nStack backtrace:\n{}", Backtrace::force_capture());
    out
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chains a panic hook that keeps the location and backtrace of the last
/// panic on the panicking thread. `catch_unwind` returns on that same
/// thread, where [`take_panic_trace`] picks the record up.
fn install_panic_trace() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        let original_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map_or_else(|| "unknown location".to_string(), ToString::to_string);
            let trace = format!("at {location}\n\nStack backtrace:\n{}", Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            original_hook(info);
        }));
    });
}

fn take_panic_trace() -> String {
    PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| format!("\nStack backtrace:\n{}", Backtrace::force_capture()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
