//! Bidirectional stream interaction pattern.

use std::{
    error,
    fmt::{self, Debug},
    marker::PhantomData,
    result,
};

use futures_lite::{Stream, StreamExt};
use futures_sink::Sink;
use futures_util::{FutureExt, SinkExt};

use crate::{
    client::{BoxStreamSync, UpdateSink},
    context::CallContext,
    interceptor::{CallInfo, Shape, StreamHandler, StreamInterceptor},
    message::{InteractionPattern, Msg},
    server::{fail, forward, race2, RpcChannel, RpcServerError, UpdateStream},
    status::Status,
    transport::{ConnectionErrors, StreamTypes},
    Connector, Reply, RpcClient, Service,
};

/// Bidirectional streaming interaction pattern
///
/// After the initial request, the client can send updates and the server can
/// send responses.
#[derive(Debug, Clone, Copy)]
pub struct BidiStreaming;
impl InteractionPattern for BidiStreaming {
    const SHAPE: Shape = Shape::BidiStreaming;
}

/// Defines update type and response type for a bidi streaming message.
pub trait BidiStreamingMsg<S: Service>: Msg<S, Pattern = BidiStreaming> {
    /// The type for request updates
    ///
    /// For a request that does not support updates, this can be safely set to any type, including
    /// the message type itself. Any update for such a request will result in an error.
    type Update: Into<S::Req> + TryFrom<S::Req> + Send + 'static;

    /// The type for the response
    type Response: Into<S::Res> + TryFrom<S::Res> + Send + 'static;
}

/// Client error when opening a bidi call
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

/// Client error when receiving an item for a bidi request
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

/// Client error for [`exchange`]
#[derive(Debug)]
pub enum ExchangeError<C: ConnectionErrors> {
    /// Unable to send an update, and the server did not report a failure
    Send(C::SendError),
    /// Error receiving a response
    Item(ItemError<C>),
    /// The task reading the responses panicked or was cancelled
    Reader,
}

impl<C: ConnectionErrors> fmt::Display for ExchangeError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(item) => fmt::Display::fmt(item, f),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

impl<C: ConnectionErrors> error::Error for ExchangeError<C> {}

impl<S, C> RpcClient<S, C>
where
    S: Service,
    C: Connector<S>,
{
    /// Bidi call to the server, request opens a stream, response is a stream
    ///
    /// Close the returned sink once all updates are sent. The response stream
    /// ends with `None` once the server is done.
    pub async fn bidi<M>(
        &self,
        msg: M,
    ) -> result::Result<
        (
            UpdateSink<C, M::Update>,
            BoxStreamSync<'static, result::Result<M::Response, ItemError<C>>>,
        ),
        Error<C>,
    >
    where
        M: BidiStreamingMsg<S>,
    {
        let msg = msg.into();
        let (mut send, recv) = self
            .source
            .open(self.header.clone())
            .await
            .map_err(Error::Open)?;
        send.send(msg).await.map_err(Error::<C>::Send)?;
        let send = UpdateSink::new(send);
        let recv = Box::pin(recv.map(move |x| match x {
            Ok(Ok(x)) => M::Response::try_from(x).map_err(|_| ItemError::DowncastError),
            Ok(Err(status)) => Err(ItemError::Status(status)),
            Err(e) => Err(ItemError::RecvError(e)),
        }));
        Ok((send, recv))
    }
}

/// Send all `updates`, close the sink and collect all responses.
///
/// Responses are read on their own task while the updates are sent, so a
/// server that answers each update before reading the next one makes progress.
/// Returns once the server has closed its side of the call.
pub async fn exchange<C, Up, Res>(
    mut sink: UpdateSink<C, Up>,
    mut responses: BoxStreamSync<'static, result::Result<Res, ItemError<C>>>,
    updates: impl IntoIterator<Item = Up>,
) -> result::Result<Vec<Res>, ExchangeError<C>>
where
    C: StreamTypes,
    Up: Into<C::Out>,
    Res: Send + 'static,
{
    let reader = tokio::spawn(async move {
        let mut res = Vec::new();
        while let Some(item) = responses.next().await {
            res.push(item?);
        }
        Ok::<_, ItemError<C>>(res)
    });
    let mut send_error = None;
    for update in updates {
        if let Err(cause) = sink.send(update).await {
            send_error = Some(cause);
            break;
        }
    }
    if send_error.is_none() {
        send_error = sink.close().await.err();
    }
    // a failed send usually means the server has ended the call, and the reader
    // has the reason
    let responses = reader
        .await
        .map_err(|_| ExchangeError::Reader)?
        .map_err(ExchangeError::Item)?;
    match send_error {
        Some(cause) => Err(ExchangeError::Send(cause)),
        None => Ok(responses),
    }
}

/// Drives a bidi streaming call once it has passed the interceptor
struct Exchanger<S, M, F, Tg> {
    req: M,
    target: Tg,
    f: F,
    ctx: CallContext,
    _p: PhantomData<S>,
}

impl<S, C, M, F, Str, Tg> StreamHandler<C> for Exchanger<S, M, F, Tg>
where
    S: Service,
    C: StreamTypes<In = S::Req, Out = Reply<S::Res>>,
    M: BidiStreamingMsg<S>,
    F: FnOnce(Tg, CallContext, M, UpdateStream<C, M::Update>) -> Str + Send,
    Str: Stream<Item = result::Result<M::Response, Status>> + Send,
    Tg: Send,
{
    type Output = ();
    type Error = RpcServerError<C>;

    async fn call<Si, St>(self, mut send: Si, recv: St) -> result::Result<(), RpcServerError<C>>
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
        // downcast the updates
        let (updates, read_error) = UpdateStream::<C, M::Update>::new(recv);
        // get the response
        let responses = f(target, ctx.clone(), req, updates);
        race2(read_error.map(Err), async {
            tokio::select! {
                done = ctx.done() => Err(done.into()),
                res = forward::<C, S::Res, _, _, _>(&mut send, responses) => res,
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
    /// updates sent by the client, and every item of the stream it returns is
    /// sent to the client. The first `Err` item ends the call with that status.
    ///
    /// If you want to support concurrent requests, you need to spawn this on a tokio task yourself.
    pub async fn bidi_streaming<M, F, Str, Tg>(
        self,
        req: M,
        target: Tg,
        f: F,
    ) -> result::Result<(), RpcServerError<C>>
    where
        M: BidiStreamingMsg<S>,
        F: FnOnce(Tg, CallContext, M, UpdateStream<C, M::Update>) -> Str + Send,
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
        let exchanger = Exchanger {
            req,
            target,
            f,
            ctx: ctx.clone(),
            _p: PhantomData::<S>,
        };
        match stream
            .intercept_stream::<C, _, _, _>(&ctx, &info, &mut send, recv, exchanger)
            .await
        {
            Ok(()) => Ok(()),
            Err(cause) => fail::<C, S::Res>(&mut send, cause).await,
        }
    }
}
