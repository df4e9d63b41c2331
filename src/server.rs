//! Server side api
//!
//! The main entry point is [RpcServer]
use std::{
    error,
    fmt::{self, Debug},
    marker::PhantomData,
    pin::Pin,
    result,
    sync::Arc,
    task::{self, Poll},
};

use futures_lite::{Future, Stream, StreamExt};
use futures_sink::Sink;
use futures_util::SinkExt;
use pin_project::pin_project;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    context::{CallContext, ContextError},
    interceptor::{Passthrough, StreamInterceptor, UnaryInterceptor},
    status::{Classify, Code, Status},
    transport::{ConnectionErrors, Incoming, StreamTypes},
    Listener, Reply, Service,
};

/// Stream of requests as seen by an [`UpdateStream`]
type UpdateSource<C> = Pin<
    Box<
        dyn Stream<Item = result::Result<<C as StreamTypes>::In, <C as ConnectionErrors>::RecvError>>
            + Send
            + 'static,
    >,
>;

/// A server for a specific service.
///
/// This is a wrapper around a [`Listener`] that serves as the entry point for the server DSL.
///
/// Type parameters:
///
/// `S` is the service type.
/// `C` is the listener that determines the transport.
/// `U` and `T` are the interceptors for rpc calls and for streaming calls.
pub struct RpcServer<S, C, U = Passthrough, T = Passthrough> {
    /// The channel on which new requests arrive.
    ///
    /// Each new request is a receiver and channel pair on which messages for this request
    /// are received and responses sent.
    source: C,
    unary: Arc<U>,
    stream: Arc<T>,
    shutdown: CancellationToken,
    _p: PhantomData<S>,
}

impl<S, C: Clone, U, T> Clone for RpcServer<S, C, U, T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            unary: Arc::clone(&self.unary),
            stream: Arc::clone(&self.stream),
            shutdown: self.shutdown.clone(),
            _p: PhantomData,
        }
    }
}

impl<S, C: Debug, U: Debug, T: Debug> Debug for RpcServer<S, C, U, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("source", &self.source)
            .field("unary", &self.unary)
            .field("stream", &self.stream)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S: Service, C: Listener<S>> RpcServer<S, C> {
    /// Create a new rpc server for a specific [Service] given a compatible
    /// [Listener].
    ///
    /// This is where a generic typed listener is converted into a server for a specific service.
    /// Calls are not intercepted until interceptors are registered, see
    /// [`RpcServer::unary_interceptor`] and [`RpcServer::stream_interceptor`].
    pub fn new(source: C) -> Self {
        Self {
            source,
            unary: Arc::new(Passthrough),
            stream: Arc::new(Passthrough),
            shutdown: CancellationToken::new(),
            _p: PhantomData,
        }
    }
}

impl<S, C, U, T> RpcServer<S, C, U, T>
where
    S: Service,
    C: Listener<S>,
    U: UnaryInterceptor,
    T: StreamInterceptor,
{
    /// Run all rpc calls through the given interceptor.
    pub fn unary_interceptor<U2: UnaryInterceptor>(self, interceptor: U2) -> RpcServer<S, C, U2, T> {
        RpcServer {
            source: self.source,
            unary: Arc::new(interceptor),
            stream: self.stream,
            shutdown: self.shutdown,
            _p: PhantomData,
        }
    }

    /// Run all streaming calls through the given interceptor.
    pub fn stream_interceptor<T2: StreamInterceptor>(self, interceptor: T2) -> RpcServer<S, C, U, T2> {
        RpcServer {
            source: self.source,
            unary: self.unary,
            stream: Arc::new(interceptor),
            shutdown: self.shutdown,
            _p: PhantomData,
        }
    }

    /// Accepts a new channel from a client. The result is an [Accepting] object that
    /// can be used to read the first request.
    ///
    /// The deadline of the call starts counting now. Fails with
    /// [`RpcServerError::Cancelled`] once the server is shut down.
    pub async fn accept(&self) -> result::Result<Accepting<S, C, U, T>, RpcServerError<C>> {
        let Incoming {
            header,
            peer,
            send,
            recv,
        } = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(RpcServerError::Cancelled),
            incoming = self.source.accept() => incoming.map_err(RpcServerError::Accept)?,
        };
        let deadline = header.timeout.map(|timeout| Instant::now() + timeout);
        let ctx = CallContext::new(header.metadata, peer, deadline)
            .with_cancellation(self.shutdown.child_token());
        Ok(Accepting {
            send,
            recv,
            ctx,
            unary: Arc::clone(&self.unary),
            stream: Arc::clone(&self.stream),
            _p: PhantomData,
        })
    }

    /// Cancel all calls in flight and stop accepting new ones.
    ///
    /// Calls in flight fail with [`Code::Cancelled`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get the underlying service listener
    pub fn into_inner(self) -> C {
        self.source
    }
}

impl<S, C, U, T> AsRef<C> for RpcServer<S, C, U, T> {
    fn as_ref(&self) -> &C {
        &self.source
    }
}

/// A call that has been accepted, but whose first request has not been read yet.
///
/// Returned by [RpcServer::accept]. Use [Accepting::read_first] to read the
/// request and get the [RpcChannel] to handle it.
pub struct Accepting<S: Service, C: Listener<S>, U = Passthrough, T = Passthrough> {
    send: C::SendSink,
    recv: C::RecvStream,
    ctx: CallContext,
    unary: Arc<U>,
    stream: Arc<T>,
    _p: PhantomData<S>,
}

impl<S: Service, C: Listener<S>, U, T> Debug for Accepting<S, C, U, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepting")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl<S: Service, C: Listener<S>, U, T> Accepting<S, C, U, T> {
    /// Context of the call
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Read the first message from the client.
    ///
    /// The return value is a tuple of `(request, channel)`.  Here `request` is the
    /// first request which is already read from the stream.  The `channel` is a
    /// [RpcChannel] that has `send` and `recv` fields that can be used to send more
    /// responses and/or receive more requests.
    pub async fn read_first(
        self,
    ) -> result::Result<(S::Req, RpcChannel<S, C, U, T>), RpcServerError<C>> {
        let Accepting {
            send,
            mut recv,
            ctx,
            unary,
            stream,
            ..
        } = self;
        // get the first message from the client. This will tell us what it wants to do.
        let request: S::Req = tokio::select! {
            done = ctx.done() => return Err(done.into()),
            msg = recv.next() => msg
                // no msg => early close
                .ok_or(RpcServerError::EarlyClose)?
                // recv error
                .map_err(RpcServerError::RecvError)?,
        };
        Ok((
            request,
            RpcChannel {
                send,
                recv,
                ctx,
                unary,
                stream,
                _p: PhantomData,
            },
        ))
    }
}

/// A channel for requests and responses for a specific service.
///
/// This just groups the sink and stream into a single type, and attaches the
/// information about the service type, the call context and the interceptors.
///
/// Sink and stream are independent, so you can take the channel apart and use
/// them independently. Doing so bypasses the interceptors.
pub struct RpcChannel<
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    U = Passthrough,
    T = Passthrough,
> {
    /// Sink to send responses to the client.
    pub send: C::SendSink,
    /// Stream to receive requests from the client.
    pub recv: C::RecvStream,
    pub(crate) ctx: CallContext,
    pub(crate) unary: Arc<U>,
    pub(crate) stream: Arc<T>,
    pub(crate) _p: PhantomData<S>,
}

impl<S, C> RpcChannel<S, C>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
{
    /// Create a new channel with the given call context and no interceptors.
    pub fn new(send: C::SendSink, recv: C::RecvStream, ctx: CallContext) -> Self {
        Self {
            send,
            recv,
            ctx,
            unary: Arc::new(Passthrough),
            stream: Arc::new(Passthrough),
            _p: PhantomData,
        }
    }
}

impl<S, C, U, T> RpcChannel<S, C, U, T>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
{
    /// Context of the call
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

impl<S, C, U, T> Debug for RpcChannel<S, C, U, T>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

/// A stream of updates
///
/// If there is any error with receiving or with decoding the updates, the stream will stall and the error will
/// cause a termination of the RPC call.
#[pin_project]
pub struct UpdateStream<C: StreamTypes, T>(
    #[pin] UpdateSource<C>,
    Option<oneshot::Sender<RpcServerError<C>>>,
    PhantomData<T>,
);

impl<C: StreamTypes, T> UpdateStream<C, T> {
    pub(crate) fn new<St>(recv: St) -> (Self, UnwrapToPending<RpcServerError<C>>)
    where
        St: Stream<Item = result::Result<C::In, C::RecvError>> + Send + 'static,
    {
        let (error_send, error_recv) = oneshot::channel();
        let error_recv = UnwrapToPending(error_recv);
        (
            Self(Box::pin(recv), Some(error_send), PhantomData),
            error_recv,
        )
    }
}

impl<C: StreamTypes, T> Debug for UpdateStream<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateStream")
            .field("failed", &self.1.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: StreamTypes, T> Stream for UpdateStream<C, T>
where
    T: TryFrom<C::In>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.0.poll_next(cx) {
            Poll::Ready(Some(msg)) => match msg {
                Ok(msg) => match T::try_from(msg) {
                    Ok(msg) => Poll::Ready(Some(msg)),
                    Err(_cause) => {
                        // we were unable to downcast, so we need to send an error
                        if let Some(tx) = this.1.take() {
                            let _ = tx.send(RpcServerError::UnexpectedUpdateMessage);
                        }
                        Poll::Pending
                    }
                },
                Err(cause) => {
                    // we got a recv error, so return pending and send the error
                    if let Some(tx) = this.1.take() {
                        let _ = tx.send(RpcServerError::RecvError(cause));
                    }
                    Poll::Pending
                }
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Server error. All server DSL methods return a `Result` with this error type.
pub enum RpcServerError<C: ConnectionErrors> {
    /// Unable to accept a new channel
    Accept(C::AcceptError),
    /// Recv side for a channel was closed before getting the first message
    EarlyClose,
    /// Got an unexpected first message, e.g. an update message
    UnexpectedStartMessage,
    /// Error receiving a message
    RecvError(C::RecvError),
    /// Error sending a response
    SendError(C::SendError),
    /// Got an unexpected update message, e.g. a request message or a non-matching update message
    UnexpectedUpdateMessage,
    /// The handler failed with the given status
    Status(Status),
    /// The deadline of the call passed before the handler completed
    DeadlineExceeded,
    /// The call was cancelled, by the client going away or by the server shutting down
    Cancelled,
}

impl<C: ConnectionErrors> RpcServerError<C> {
    /// The status sent to the client when a call fails with this error
    pub fn to_status(&self) -> Status {
        match self {
            Self::Status(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl<C: ConnectionErrors> Classify for RpcServerError<C> {
    fn code(&self) -> Code {
        match self {
            Self::Status(status) => status.code(),
            Self::Accept(_) | Self::RecvError(_) | Self::SendError(_) => Code::Unavailable,
            Self::UnexpectedStartMessage | Self::UnexpectedUpdateMessage => Code::InvalidArgument,
            Self::EarlyClose | Self::Cancelled => Code::Cancelled,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }
}

impl<C: ConnectionErrors> From<ContextError> for RpcServerError<C> {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
            ContextError::Cancelled => Self::Cancelled,
        }
    }
}

impl<C: ConnectionErrors> fmt::Debug for RpcServerError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(arg0) => f.debug_tuple("Accept").field(arg0).finish(),
            Self::EarlyClose => write!(f, "EarlyClose"),
            Self::RecvError(arg0) => f.debug_tuple("RecvError").field(arg0).finish(),
            Self::SendError(arg0) => f.debug_tuple("SendError").field(arg0).finish(),
            Self::UnexpectedStartMessage => f.debug_tuple("UnexpectedStartMessage").finish(),
            Self::UnexpectedUpdateMessage => f.debug_tuple("UnexpectedUpdateMessage").finish(),
            Self::Status(arg0) => f.debug_tuple("Status").field(arg0).finish(),
            Self::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl<C: ConnectionErrors> fmt::Display for RpcServerError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => fmt::Display::fmt(status, f),
            Self::DeadlineExceeded => fmt::Display::fmt(&ContextError::DeadlineExceeded, f),
            Self::Cancelled => fmt::Display::fmt(&ContextError::Cancelled, f),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl<C: ConnectionErrors> error::Error for RpcServerError<C> {}

/// Take an oneshot receiver and just return Pending the underlying future returns `Err(oneshot::Canceled)`
pub(crate) struct UnwrapToPending<T>(oneshot::Receiver<T>);

impl<T> Future for UnwrapToPending<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(x)) => Poll::Ready(x),
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) async fn race2<T, A: Future<Output = T>, B: Future<Output = T>>(f1: A, f2: B) -> T {
    tokio::select! {
        x = f1 => x,
        x = f2 => x,
    }
}

/// Send every response to the client, stopping at the first error.
pub(crate) async fn forward<C, R, M, Si, Str>(
    send: &mut Si,
    responses: Str,
) -> result::Result<(), RpcServerError<C>>
where
    C: ConnectionErrors,
    M: Into<R>,
    Si: Sink<Reply<R>, Error = C::SendError> + Unpin,
    Str: Stream<Item = result::Result<M, Status>>,
{
    tokio::pin!(responses);
    while let Some(response) = responses.next().await {
        let response = response.map_err(RpcServerError::Status)?;
        // turn into a S::Res so we can send it
        let response = Ok(response.into());
        // send it and return the error if any
        send.send(response)
            .await
            .map_err(RpcServerError::SendError)?;
    }
    Ok(())
}

/// End a failed call: send its status as the final frame and return the error.
pub(crate) async fn fail<C, R>(
    send: &mut C::SendSink,
    cause: RpcServerError<C>,
) -> result::Result<(), RpcServerError<C>>
where
    C: StreamTypes<Out = Reply<R>>,
{
    tracing::debug!("call failed: {cause}");
    // the client might be gone already
    send.send(Err(cause.to_status())).await.ok();
    Err(cause)
}

/// Run a server loop, invoking a handler callback for each request.
///
/// Each call is handled on its own task. Returns `Ok(())` once the server is
/// shut down, or the error if accepting a channel fails.
pub async fn run_server_loop<S, C, U, T, Tg, F, Fut>(
    server: RpcServer<S, C, U, T>,
    target: Tg,
    handler: F,
) -> result::Result<(), RpcServerError<C>>
where
    S: Service,
    C: Listener<S>,
    U: UnaryInterceptor,
    T: StreamInterceptor,
    Tg: Clone + Send + 'static,
    F: Fn(RpcChannel<S, C, U, T>, S::Req, Tg) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = result::Result<(), RpcServerError<C>>> + Send + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let accepting = match server.accept().await {
            Ok(accepting) => accepting,
            Err(RpcServerError::Cancelled) => return Ok(()),
            Err(cause) => return Err(cause),
        };
        let target = target.clone();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let (req, chan) = match accepting.read_first().await {
                Ok(x) => x,
                Err(cause) => {
                    tracing::warn!("failed to read first message: {cause}");
                    return;
                }
            };
            if let Err(cause) = (*handler)(chan, req, target).await {
                tracing::debug!("call ended with error: {cause}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::flume::FlumeListener;

    type ServerError = RpcServerError<FlumeListener<u64, Reply<u64>>>;

    #[test]
    fn error_classification() {
        assert_eq!(ServerError::DeadlineExceeded.code(), Code::DeadlineExceeded);
        assert_eq!(ServerError::Cancelled.code(), Code::Cancelled);
        assert_eq!(ServerError::EarlyClose.code(), Code::Cancelled);
        assert_eq!(ServerError::UnexpectedUpdateMessage.code(), Code::InvalidArgument);
        assert_eq!(
            ServerError::SendError(crate::transport::flume::SendError::ReceiverDropped).code(),
            Code::Unavailable
        );
        let status = Status::not_found("no such user");
        assert_eq!(ServerError::Status(status.clone()).code(), Code::NotFound);
        assert_eq!(ServerError::Status(status.clone()).to_status(), status);
    }

    #[test]
    fn status_of_context_errors() {
        let status = ServerError::from(ContextError::DeadlineExceeded).to_status();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), "context deadline exceeded");
        let status = ServerError::from(ContextError::Cancelled).to_status();
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), "context canceled");
    }
}
