//! Server streaming interaction pattern.

use std::{
    error,
    fmt::{self, Debug},
    marker::PhantomData,
    result,
};

use futures_lite::{Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{FutureExt, SinkExt, TryFutureExt};

use crate::{
    client::{BoxStreamSync, DeferDrop},
    context::CallContext,
    interceptor::{CallInfo, Shape, StreamHandler, StreamInterceptor},
    message::{InteractionPattern, Msg},
    server::{fail, forward, RpcChannel, RpcServerError},
    status::Status,
    transport::{ConnectionErrors, StreamTypes},
    Connector, Reply, RpcClient, Service,
};

/// Server streaming interaction pattern
///
/// After the initial request, the server can send a stream of responses.
#[derive(Debug, Clone, Copy)]
pub struct ServerStreaming;
impl InteractionPattern for ServerStreaming {
    const SHAPE: Shape = Shape::ServerStreaming;
}

/// Defines response type for a server streaming message.
pub trait ServerStreamingMsg<S: Service>: Msg<S, Pattern = ServerStreaming> {
    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a server streaming call
#[derive(Debug)]
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream at all
    Open(C::OpenError),
    /// Unable to send the request to the server
    Send(C::SendError),
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<C: ConnectionErrors> error::Error for Error<C> {}

/// Client error when handling responses from a server streaming request
#[derive(Debug)]
pub enum ItemError<C: ConnectionErrors> {
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
    /// The call failed on the server. This is the last item of the stream.
    Status(Status),
}

impl<C: ConnectionErrors> fmt::Display for ItemError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => fmt::Display::fmt(status, f),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl<C: ConnectionErrors> error::Error for ItemError<C> {}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// Bidi call to the server, request opens a stream, response is a stream
    ///
    /// The stream ends with `None` once the server has sent all responses.
    pub async fn server_streaming<M>(
        &self,
        msg: M,
    ) -> result::Result<BoxStreamSync<'static, result::Result<M::Response, ItemError<C>>>, Error<C>>
    where
        M: ServerStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, recv) = self
            .source
            .open(self.header.clone())
            .await
            .map_err(Error::Open)?;
        send.send(msg).map_err(Error::<C>::Send).await?;
        let recv = recv.map(move |x| match x {
            Ok(Ok(x)) => M::Response::try_from(x).map_err(|_| ItemError::DowncastError),
            Ok(Err(status)) => Err(ItemError::Status(status)),
            Err(e) => Err(ItemError::RecvError(e)),
        });
        // keep send alive so the request on the server side does not get cancelled
        let recv = Box::pin(DeferDrop(recv, send));
        Ok(recv)
    }
}

/// Drives a server streaming call once it has passed the interceptor
struct Responder<S, M, F, Tg> {
    req: M,
    target: Tg,
    f: F,
    ctx: CallContext,
    _p: PhantomData<S>,
}

impl<S, C, M, F, Str, Tg> StreamHandler<C> for Responder<S, M, F, Tg>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    M: ServerStreamingMsg<S>,
    F: FnOnce(Tg, CallContext, M) -> Str + Send,
    Str: Stream<Item = result::Result<M::Response, Status>> + Send,
    Tg: Send,
{
    type Output = ();
    type Error = RpcServerError<C>;

    async fn call<Si, St>(self, mut send: Si, mut recv: St) -> result::Result<(), RpcServerError<C>>
    where
        Si: Sink<C::Out, Error = C::SendError> + Send + Unpin,
        St: Stream<Item = result::Result<C::In, C::RecvError>> + Send + Unpin + 'static,
    {
        let Self {
            req,
            target,
            f,
            ctx,
            ..
        } = self;
        // cancel if we get an update, no matter what it is
        let cancel = recv.next().map(|msg| match msg {
            Some(_) => RpcServerError::<C>::UnexpectedUpdateMessage,
            None => RpcServerError::<C>::Cancelled,
        });
        // get the response
        let responses = f(target, ctx.clone(), req);
        // race the computation and the cancellation
        tokio::select! {
            err = cancel => Err(err),
            done = ctx.done() => Err(done.into()),
            res = forward::<C, S::Res, _, _, _>(&mut send, responses) => res,
        }
    }
}

impl<S, C, U, T> RpcChannel<S, C, U, T>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    T: StreamInterceptor,
{
    /// handle the message M using the given function on the target object
    ///
    /// The call goes through the stream interceptor of the server. Every item of
    /// the stream returned by `f` is sent to the client. The first `Err` item ends
    /// the call with that status.
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn server_streaming<M, F, Str, Tg>(
        self,
        req: M,
        target: Tg,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: ServerStreamingMsg<S>,
        F: FnOnce(Tg, CallContext, M) -> Str + Send,
        Str: Stream<Item = result::Result<M::Response, Status>> + Send,
        Tg: Send,
    {
        let Self {
            mut send,
            recv,
            ctx,
            stream,
            ..
        } = self;
        let info = CallInfo::for_msg::<S, M>();
        let responder = Responder {
            req,
            target,
            f,
            ctx: ctx.clone(),
            _p: PhantomData::<S>,
        };
        match stream
            .intercept_stream::<C, _, _, _>(&ctx, &info, &mut send, recv, responder)
            .await
        {
            Ok(()) => Ok(()),
            Err(cause) => fail::<C, S::Res>(&mut send, cause).await,
        }
    }
}
