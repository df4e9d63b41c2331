//! Interceptors wrapping every call handled by a server
//!
//! A [`RpcServer`](crate::RpcServer) runs every rpc call through its
//! [`UnaryInterceptor`] and every streaming call (server streaming, client
//! streaming and bidi streaming) through its [`StreamInterceptor`]. Both default
//! to [`Passthrough`].
//!
//! An interceptor sees the call context, a description of the call and the
//! next step of the call. It must invoke the next step exactly once and return
//! its result. Streaming interceptors may substitute the two halves of the
//! channel, as long as the substitutes forward every message.
use std::fmt;

use futures_lite::{Future, Stream};
use futures_sink::Sink;

use crate::{
    context::CallContext,
    message::{InteractionPattern, Msg},
    status::Classify,
    transport::StreamTypes,
    Service,
};

pub mod counting;
mod logging;

pub use logging::{CallRecord, Counts, LoggingInterceptor, Outcome};

/// The interaction pattern of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// One request, one response
    Unary,
    /// One request, a stream of responses
    ServerStreaming,
    /// One request followed by a stream of updates, one response
    ClientStreaming,
    /// One request followed by a stream of updates, a stream of responses
    BidiStreaming,
}

impl Shape {
    /// True for all shapes that go through the [`StreamInterceptor`]
    pub fn is_streaming(self) -> bool {
        !matches!(self, Shape::Unary)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Unary => write!(f, "unary"),
            Shape::ServerStreaming => write!(f, "server streaming"),
            Shape::ClientStreaming => write!(f, "client streaming"),
            Shape::BidiStreaming => write!(f, "bidi streaming"),
        }
    }
}

/// Description of a call, as seen by interceptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    full_method: String,
    shape: Shape,
}

impl CallInfo {
    /// Describe a call of the given method, e.g. `/ExampleService/GetUser`
    pub fn new(full_method: impl Into<String>, shape: Shape) -> Self {
        Self {
            full_method: full_method.into(),
            shape,
        }
    }

    /// Describe a call of message type `M` on service `S`.
    ///
    /// The full method is `/<service>/<message>`, using the unqualified type names.
    pub fn of<S, M>(shape: Shape) -> Self {
        Self::new(
            format!("/{}/{}", short_type_name::<S>(), short_type_name::<M>()),
            shape,
        )
    }

    /// Describe a call of message `M` on service `S`, with the shape of its interaction pattern.
    pub fn for_msg<S: Service, M: Msg<S>>() -> Self {
        Self::of::<S, M>(<M::Pattern as InteractionPattern>::SHAPE)
    }

    /// The full method name
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    /// The last segment of the full method name
    pub fn method(&self) -> &str {
        self.full_method
            .rsplit('/')
            .next()
            .unwrap_or(&self.full_method)
    }

    /// The interaction pattern of the call
    pub fn shape(&self) -> Shape {
        self.shape
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name)
}

/// Intercepts rpc calls.
pub trait UnaryInterceptor: Send + Sync + 'static {
    /// Run `next` for the request, exactly once, and return its result.
    fn intercept_unary<Req, Res, E, H, Fut>(
        &self,
        ctx: &CallContext,
        info: &CallInfo,
        req: Req,
        next: H,
    ) -> impl Future<Output = Result<Res, E>> + Send
    where
        Req: Send,
        Res: Send,
        E: Classify + Send,
        H: FnOnce(Req) -> Fut + Send,
        Fut: Future<Output = Result<Res, E>> + Send;
}

/// The remainder of a streaming call, after interception.
///
/// Implemented by the server for each streaming pattern. The handler can be
/// driven with any pair of channel halves that carry the right messages.
pub trait StreamHandler<C: StreamTypes>: Send {
    /// What the call produces on success
    type Output: Send;
    /// What the call fails with
    type Error: Classify + Send;

    /// Drive the call to completion over the given channel halves.
    fn call<Si, St>(
        self,
        send: Si,
        recv: St,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send
    where
        Si: Sink<C::Out, Error = C::SendError> + Send + Unpin,
        St: Stream<Item = Result<C::In, C::RecvError>> + Send + Unpin + 'static;
}

/// Intercepts server streaming, client streaming and bidi streaming calls.
pub trait StreamInterceptor: Send + Sync + 'static {
    /// Run `next` over `send` and `recv`, or over wrappers of them, exactly once
    /// and return its result.
    fn intercept_stream<C, H, Si, St>(
        &self,
        ctx: &CallContext,
        info: &CallInfo,
        send: Si,
        recv: St,
        next: H,
    ) -> impl Future<Output = Result<H::Output, H::Error>> + Send
    where
        C: StreamTypes,
        H: StreamHandler<C>,
        Si: Sink<C::Out, Error = C::SendError> + Send + Unpin,
        St: Stream<Item = Result<C::In, C::RecvError>> + Send + Unpin + 'static;
}

/// Interceptor that does nothing but invoke the next step.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl UnaryInterceptor for Passthrough {
    async fn intercept_unary<Req, Res, E, H, Fut>(
        &self,
        _ctx: &CallContext,
        _info: &CallInfo,
        req: Req,
        next: H,
    ) -> Result<Res, E>
    where
        Req: Send,
        Res: Send,
        E: Classify + Send,
        H: FnOnce(Req) -> Fut + Send,
        Fut: Future<Output = Result<Res, E>> + Send,
    {
        next(req).await
    }
}

impl StreamInterceptor for Passthrough {
    async fn intercept_stream<C, H, Si, St>(
        &self,
        _ctx: &CallContext,
        _info: &CallInfo,
        send: Si,
        recv: St,
        next: H,
    ) -> Result<H::Output, H::Error>
    where
        C: StreamTypes,
        H: StreamHandler<C>,
        Si: Sink<C::Out, Error = C::SendError> + Send + Unpin,
        St: Stream<Item = Result<C::In, C::RecvError>> + Send + Unpin + 'static,
    {
        next.call(send, recv).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ExampleService;
    struct GetUser;
    struct Wrapper<T>(T);

    #[test]
    fn call_info_names() {
        let info = CallInfo::of::<ExampleService, GetUser>(Shape::Unary);
        assert_eq!(info.full_method(), "/ExampleService/GetUser");
        assert_eq!(info.method(), "GetUser");
        assert!(!info.shape().is_streaming());

        let info = CallInfo::of::<ExampleService, Wrapper<GetUser>>(Shape::BidiStreaming);
        assert_eq!(info.method(), "Wrapper");
        assert!(info.shape().is_streaming());

        let info = CallInfo::new("NoSlashes", Shape::ClientStreaming);
        assert_eq!(info.method(), "NoSlashes");
    }
}
