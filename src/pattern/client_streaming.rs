//! Client streaming interaction pattern.

use std::{
    error,
    fmt::{self, Debug},
    marker::PhantomData,
    result,
};

use futures_lite::{future::Boxed, Future, Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{FutureExt, SinkExt, TryFutureExt};

use crate::{
    client::UpdateSink,
    context::CallContext,
    interceptor::{CallInfo, Shape, StreamHandler, StreamInterceptor},
    message::{InteractionPattern, Msg},
    server::{fail, race2, RpcChannel, RpcServerError, UpdateStream},
    status::Status,
    transport::{ConnectionErrors, StreamTypes},
    Connector, Reply, RpcClient, Service,
};

/// Client streaming interaction pattern
///
/// After the initial request, the client can send updates, but there is only
/// one response.
#[derive(Debug, Clone, Copy)]
pub struct ClientStreaming;
impl InteractionPattern for ClientStreaming {
    const SHAPE: Shape = Shape::ClientStreaming;
}

/// Defines update type and response type for a client streaming message.
pub trait ClientStreamingMsg<S: Service>: Msg<S, Pattern = ClientStreaming> {
    /// The type for request updates
    ///
    /// For a request that does not support updates, this can be safely set to any type, including
    /// the message type itself. Any update for such a request will result in an error.
    type Update: Into<S::Req> + TryFrom<S::Req> + Send + 'static;

    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a client streaming call
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

/// Client error when receiving the response of a client streaming call
#[derive(Debug)]
pub enum ItemError<C: ConnectionErrors> {
    /// Connection was closed before receiving the first message
    EarlyClose,
    /// Unable to receive the response from the server
    RecvError(C::RecvError),
    /// Unexpected response from the server
    DowncastError,
    /// The call failed on the server
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
    /// Call to the server that allows the client to stream, single response
    ///
    /// Close the returned sink once all updates are sent. The server answers
    /// only after that.
    pub async fn client_streaming<M>(
        &self,
        msg: M,
    ) -> result::Result<
        (
            UpdateSink<C, M::Update>,
            Boxed<result::Result<M::Response, ItemError<C>>>,
        ),
        Error<C>,
    >
    where
        M: ClientStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, mut recv) = self
            .source
            .open(self.header.clone())
            .await
            .map_err(Error::Open)?;
        send.send(msg).map_err(Error::Send).await?;
        let send = UpdateSink::<C, M::Update>::new(send);
        let recv = async move {
            let item = recv.next().await.ok_or(ItemError::EarlyClose)?;

            match item {
                Ok(Ok(msg)) => M::Response::try_from(msg).map_err(|_| ItemError::DowncastError),
                Ok(Err(status)) => Err(ItemError::Status(status)),
                Err(e) => Err(ItemError::RecvError(e)),
            }
        }
        .boxed();
        Ok((send, recv))
    }
}

/// Drives a client streaming call once it has passed the interceptor
struct Aggregator<S, M, F, Tg> {
    req: M,
    target: Tg,
    f: F,
    ctx: CallContext,
    _p: PhantomData<S>,
}

impl<S, C, M, F, Fut, Tg> StreamHandler<C> for Aggregator<S, M, F, Tg>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    M: ClientStreamingMsg<S>,
    F: FnOnce(Tg, CallContext, M, UpdateStream<C, M::Update>) -> Fut + Send,
    Fut: Future<Output = result::Result<M::Response, Status>> + Send,
    Tg: Send,
{
    type Output = M::Response;
    type Error = RpcServerError<C>;

    async fn call<Si, St>(
        self,
        _send: Si,
        recv: St,
    ) -> result::Result<M::Response, RpcServerError<C>>
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
        let (updates, read_error) = UpdateStream::<C, M::Update>::new(recv);
        race2(read_error.map(Err), async {
            tokio::select! {
                done = ctx.done() => Err(done.into()),
                res = f(target, ctx.clone(), req, updates) => res.map_err(RpcServerError::Status),
            }
        })
        .await
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
    /// The call goes through the stream interceptor of the server. `f` gets the
    /// updates sent by the client, and its result is sent as the single
    /// response once the interceptor is done.
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn client_streaming<M, F, Fut, Tg>(
        self,
        req: M,
        target: Tg,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: ClientStreamingMsg<S>,
        F: FnOnce(Tg, CallContext, M, UpdateStream<C, M::Update>) -> Fut + Send,
        Fut: Future<Output = result::Result<M::Response, Status>> + Send,
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
        let aggregator = Aggregator {
            req,
            target,
            f,
            ctx: ctx.clone(),
            _p: PhantomData::<S>,
        };
        match stream
            .intercept_stream::<C, _, _, _>(&ctx, &info, &mut send, recv, aggregator)
            .await
        {
            // turn into a S::Res so we can send it
            Ok(res) => send
                .send(Ok(res.into()))
                .await
                .map_err(RpcServerError::SendError),
            Err(cause) => fail::<C, S::Res>(&mut send, cause).await,
        }
    }
}
