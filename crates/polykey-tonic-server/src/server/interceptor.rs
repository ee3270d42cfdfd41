//! Per-call structured logging.
//!
//! [`LoggingLayer`] is installed once on the transport with
//! `Server::layer`, so every routed call passes through [`LoggingService`]
//! before it reaches a handler. For each call it emits a `"call received"`
//! event and exactly one `"call finished"` event carrying the method, the
//! elapsed time and the gRPC status code. Calls to a quiet method (the health
//! check by default) produce no events at all.
//!
//! The layer is an observer: the inner response head, body frames and errors
//! are passed through unchanged.
//!
//! ## Open calls
//!
//! A call counts as open from the moment it enters the layer until its
//! response body is dropped, so streaming responses stay open for as long as
//! the client listens. Each call is counted twice: in the host-wide
//! [`InFlightCalls`] read by the shutdown coordinator and in the counter of
//! the connection carrying it, which holds off the idle timeout.
//!
//! ## Status detection
//!
//! tonic answers a failed unary handler with a trailers-only response, which
//! carries `grpc-status` in the response head. A head without `grpc-status`
//! means the handler produced a message and the call is `Ok`.

use crate::server::listener::ConnectionInfo;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::future::BoxFuture;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::{Code, Status};
use tower::{Layer, Service};

/// Count of open calls.
///
/// The host-wide counter is shared between the layer and the shutdown
/// coordinator, which reports it while draining. Each connection also has
/// one of its own.
#[derive(Clone, Debug, Default)]
pub struct InFlightCalls(Arc<AtomicUsize>);

impl InFlightCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(&self.0))
    }
}

/// Decrements the in-flight count on drop, so cancelled calls are released
/// too.
pub(crate) struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bookkeeping for one call, from entry until its status is known.
#[derive(Debug)]
pub struct CallRecord {
    method: String,
    started: Instant,
}

impl CallRecord {
    pub fn start(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            started: Instant::now(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn received(&self) {
        tracing::info!(method = %self.method, "call received");
    }

    /// Emits the `"call finished"` event at ERROR for a failed call and INFO
    /// otherwise. Returns the elapsed time.
    pub fn finish(self, code: Code) -> Duration {
        let duration = self.started.elapsed();
        if code == Code::Ok {
            tracing::info!(method = %self.method, ?duration, ?code, "call finished");
        } else {
            tracing::error!(method = %self.method, ?duration, ?code, "call finished");
        }
        duration
    }
}

/// Reads the gRPC status from a response head.
pub fn response_code<B>(response: &http::Response<B>) -> Code {
    Status::from_header_map(response.headers()).map_or(Code::Ok, |status| status.code())
}

pin_project! {
    /// Response body that keeps its call open until the transport drops it.
    pub struct CallBody<B> {
        #[pin]
        inner: B,
        _call: InFlightGuard,
        _connection: Option<InFlightGuard>,
    }
}

impl<B> CallBody<B> {
    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B: fmt::Debug> fmt::Debug for CallBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBody")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<B: Body> Body for CallBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Layer that wraps the routed services in a [`LoggingService`].
#[derive(Clone, Debug)]
pub struct LoggingLayer {
    quiet_methods: Arc<HashSet<String>>,
    in_flight: InFlightCalls,
}

impl LoggingLayer {
    /// `quiet_methods` are exact `/package.Service/Method` paths served
    /// without logging.
    pub fn new<I, M>(quiet_methods: I, in_flight: InFlightCalls) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        Self {
            quiet_methods: Arc::new(quiet_methods.into_iter().map(Into::into).collect()),
            in_flight,
        }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            quiet_methods: Arc::clone(&self.quiet_methods),
            in_flight: self.in_flight.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
    quiet_methods: Arc<HashSet<String>>,
    in_flight: InFlightCalls,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for LoggingService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<CallBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // The readied service goes into the future; a fresh clone stays
        // behind for the next poll_ready.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);

        let call = self.in_flight.enter();
        let connection = req
            .extensions_mut()
            .remove::<ConnectionInfo>()
            .map(|info| {
                // Keeps `tonic::Request::remote_addr` working for handlers.
                req.extensions_mut().insert(info.remote);
                info.calls.enter()
            });
        let record = CallRecord::start(req.uri().path());
        let quiet = self.quiet_methods.contains(record.method());

        Box::pin(async move {
            let result = if quiet {
                inner.call(req).await
            } else {
                record.received();
                let result = inner.call(req).await;
                let code = match &result {
                    Ok(response) => response_code(response),
                    Err(_) => Code::Unknown,
                };
                record.finish(code);
                result
            };

            result.map(|response| {
                response.map(|inner| CallBody {
                    inner,
                    _call: call,
                    _connection: connection,
                })
            })
        })
    }
}
