//! RPC interaction pattern.

use std::{
    error,
    fmt::{self, Debug},
    result,
};

use futures_lite::{Future, StreamExt};
use futures_util::{FutureExt, SinkExt};

use crate::{
    context::CallContext,
    interceptor::{CallInfo, Shape, StreamInterceptor, UnaryInterceptor},
    message::{InteractionPattern, Msg},
    server::{fail, RpcChannel, RpcServerError},
    status::Status,
    transport::{ConnectionErrors, StreamTypes},
    Connector, Reply, RpcClient, Service,
};

/// Rpc interaction pattern
///
/// There is only one request and one response.
#[derive(Debug, Clone, Copy)]
pub struct Rpc;
impl InteractionPattern for Rpc {
    const SHAPE: Shape = Shape::Unary;
}

/// Defines the response type for a rpc message.
///
/// Since this is the most common interaction pattern, this also implements [Msg] for you
/// automatically, with the interaction pattern set to [Rpc]. This is to reduce boilerplate
/// when defining rpc messages.
pub trait RpcMsg<S: Service>: Msg<S, Pattern = Rpc> {
    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// We can only do this for one trait, so we do it for RpcMsg since it is the most common
impl<T: RpcMsg<S>, S: Service> Msg<S> for T {
    type Pattern = Rpc;
}

/// Client error. All client DSL methods return a `Result` with this error type.
#[derive(Debug)]
pub enum Error<C: ConnectionErrors> {
    /// Unable to open a substream at all
    Open(C::OpenError),
    /// Unable to send the request to the server
    Send(C::SendError),
    /// Server closed the stream before sending a response
    EarlyClose,
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
    /// The call failed on the server
    Status(Status),
}

impl<C: ConnectionErrors> fmt::Display for Error<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => fmt::Display::fmt(status, f),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl<C: ConnectionErrors> error::Error for Error<C> {}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// RPC call to the server, single request, single response
    pub async fn rpc<M>(&self, msg: M) -> result::Result<M::Response, Error<C>>
    where
        M: RpcMsg<S>,
    {
        let msg = msg.into();
        let (mut send, mut recv) = self
            .source
            .open(self.header.clone())
            .await
            .map_err(Error::Open)?;
        send.send(msg).await.map_err(Error::<C>::Send)?;
        let res = recv
            .next()
            .await
            .ok_or(Error::<C>::EarlyClose)?
            .map_err(Error::<C>::RecvError)?
            .map_err(Error::<C>::Status)?;
        // keep send alive until we have the answer
        drop(send);
        M::Response::try_from(res).map_err(|_| Error::DowncastError)
    }
}

impl<S, C, U, T> RpcChannel<S, C, U, T>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    U: UnaryInterceptor,
    T: StreamInterceptor,
{
    /// handle the message of type `M` using the given function on the target object
    ///
    /// The call goes through the unary interceptor of the server. It fails with
    /// [`RpcServerError::DeadlineExceeded`] or [`RpcServerError::Cancelled`] if the
    /// call context is done before `f` completes, and with the status returned by
    /// `f` if that fails. Either way the client receives the status of the failure.
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn rpc<M, F, Fut, Tg>(
        self,
        req: M,
        target: Tg,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: RpcMsg<S>,
        F: FnOnce(Tg, CallContext, M) -> Fut + Send,
        Fut: Future<Output = result::Result<M::Response, Status>> + Send,
        Tg: Send,
    {
        let Self {
            mut send,
            mut recv,
            ctx,
            unary,
            ..
        } = self;
        let info = CallInfo::for_msg::<S, M>();
        let call_ctx = ctx.clone();
        let handler = move |req: M| async move {
            // cancel if we get an update, no matter what it is
            let cancel = recv.next().map(|msg| match msg {
                Some(_) => RpcServerError::<C>::UnexpectedUpdateMessage,
                None => RpcServerError::<C>::Cancelled,
            });
            // race the computation and the cancellation
            tokio::select! {
                err = cancel => Err(err),
                done = call_ctx.done() => Err(done.into()),
                res = f(target, call_ctx.clone(), req) => res.map_err(RpcServerError::Status),
            }
        };
        match unary.intercept_unary(&ctx, &info, req, handler).await {
            // turn into a S::Res so we can send it
            Ok(res) => send
                .send(Ok(res.into()))
                .await
                .map_err(RpcServerError::SendError),
            Err(cause) => fail::<C, S::Res>(&mut send, cause).await,
        }
    }
}
