//! Middleware chain runner with arity-based error forwarding.
//!
//! A middleware's arity (does it accept an error as its first argument) is
//! fixed at registration time rather than inspected at call time: each
//! registered entry carries a `HandlerKind` tag alongside the callable, and
//! the runner's error-forwarding scan is a linear search over that tag
//! instead of introspecting the callable itself. Handlers are boxed
//! trait-object closures (not bare fn pointers) so a middleware can close
//! over shared state such as the ETag cache.

use crate::error::GatewayError;
use crate::hash::handler_identity;
use crate::pipeline::RequestContext;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A plain 3-arity handler: `(req, res, next)` in the source idiom.
pub type HandlerFn = Arc<dyn for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> + Send + Sync>;

/// A 4-arity error handler: `(err, req, res, next)`.
pub type ErrorHandlerFn = Arc<
    dyn for<'a> Fn(&'a GatewayError, &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub enum HandlerKind {
    Handler(HandlerFn),
    ErrorHandler(ErrorHandlerFn),
}

/// A handler plus its registration-site identity hash, recorded once at
/// registration rather than derived at dispatch time.
#[derive(Clone)]
pub struct RegisteredMiddleware {
    pub name: &'static str,
    pub hash: u64,
    pub kind: HandlerKind,
}

impl RegisteredMiddleware {
    pub fn handler(
        site: &'static str,
        f: impl for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: site,
            hash: handler_identity(site),
            kind: HandlerKind::Handler(Arc::new(f)),
        }
    }

    pub fn error_handler(
        site: &'static str,
        f: impl for<'a> Fn(&'a GatewayError, &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: site,
            hash: handler_identity(site),
            kind: HandlerKind::ErrorHandler(Arc::new(f)),
        }
    }

    pub fn is_error_handler(&self) -> bool {
        matches!(self.kind, HandlerKind::ErrorHandler(_))
    }
}

impl fmt::Debug for RegisteredMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMiddleware")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Walk `chain` sequentially. Without an error in flight, only 3-arity
/// handlers run; any handler-signaled fault switches the runner into
/// error-forwarding mode, skipping handlers until a 4-arity error handler is
/// found. If the chain drains with an error still outstanding, the caller is
/// responsible for emitting the terminal error response.
pub async fn run_chain(
    chain: &[RegisteredMiddleware],
    ctx: &mut RequestContext,
) -> Result<(), GatewayError> {
    let mut pending_error: Option<GatewayError> = None;

    for entry in chain {
        match (&entry.kind, &pending_error) {
            (HandlerKind::Handler(f), None) => {
                if let Err(err) = f(ctx).await {
                    pending_error = Some(err);
                }
            }
            (HandlerKind::ErrorHandler(f), Some(err)) => match f(err, ctx).await {
                Ok(()) => pending_error = None,
                Err(new_err) => pending_error = Some(new_err),
            },
            _ => continue,
        }
    }

    match pending_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestContext;

    fn failing_handler<'a>(_ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(async { Err(GatewayError::BadRequest("boom".into())) })
    }

    fn recovering_error_handler<'a>(
        _err: &'a GatewayError,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<(), GatewayError>> {
        ctx.recovered = true;
        Box::pin(async { Ok(()) })
    }

    fn passthrough_handler<'a>(_ctx: &'a mut RequestContext) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(async { Ok(()) })
    }

    #[tokio::test]
    async fn error_forwards_to_next_error_handler_and_skips_plain_handlers() {
        let chain = vec![
            RegisteredMiddleware::handler("fails", failing_handler),
            RegisteredMiddleware::handler("skipped", passthrough_handler),
            RegisteredMiddleware::error_handler("recovers", recovering_error_handler),
        ];
        let mut ctx = RequestContext::for_test();
        let result = run_chain(&chain, &mut ctx).await;
        assert!(result.is_ok());
        assert!(ctx.recovered);
    }

    #[tokio::test]
    async fn error_with_no_handler_propagates_to_caller() {
        let chain = vec![RegisteredMiddleware::handler("fails", failing_handler)];
        let mut ctx = RequestContext::for_test();
        let result = run_chain(&chain, &mut ctx).await;
        assert!(result.is_err());
    }
}
