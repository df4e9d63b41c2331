//! The logging interceptor
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use futures_lite::{Future, Stream};
use futures_sink::Sink;
use tokio::time::Instant;

use super::{
    counting::{self, MessageCounts},
    CallInfo, Shape, StreamHandler, StreamInterceptor, UnaryInterceptor,
};
use crate::{
    context::CallContext,
    logging::Logger,
    metadata,
    status::{Classify, Code},
    transport::StreamTypes,
};

/// Interceptor that writes a record for the start and the end of every call.
///
/// Records go to the [`Logger`] given on construction. For streaming calls the
/// number of messages received from and sent to the client is counted, see
/// [`counting`]. The first request and the final frame of a call are not part
/// of these counts.
///
/// This differs from a gRPC stream interceptor, which reads the request of a
/// server streaming call through the wrapped stream. A server streaming call
/// that gRPC records with `received messages: 1` is recorded here with
/// `received messages: 0`.
///
/// The interceptor never changes the outcome of a call.
#[derive(Debug, Clone)]
pub struct LoggingInterceptor<L = Arc<dyn Logger>> {
    logger: L,
}

impl<L: Logger> LoggingInterceptor<L> {
    /// Create a logging interceptor that writes to `logger`
    pub fn new(logger: L) -> Self {
        Self { logger }
    }

    /// The logger this interceptor writes to
    pub fn logger(&self) -> &L {
        &self.logger
    }
}

impl<L: Logger> UnaryInterceptor for LoggingInterceptor<L> {
    async fn intercept_unary<Req, Res, E, H, Fut>(
        &self,
        ctx: &CallContext,
        info: &CallInfo,
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
        let mut record = CallRecord::begin(ctx, info);
        record.log_start(&self.logger);
        let res = next(req).await;
        record.finish(&res, None);
        record.log_end(&self.logger);
        res
    }
}

impl<L: Logger> StreamInterceptor for LoggingInterceptor<L> {
    async fn intercept_stream<C, H, Si, St>(
        &self,
        ctx: &CallContext,
        info: &CallInfo,
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
        let mut record = CallRecord::begin(ctx, info);
        record.log_start(&self.logger);
        let (send, recv, counts) = counting::wrap(send, recv);
        let res = next.call(send, recv).await;
        record.finish(&res, Some(&*counts));
        record.log_end(&self.logger);
        res
    }
}

/// Message counts of a finished streaming call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Messages received from the client
    pub received: u64,
    /// Messages sent to the client
    pub sent: u64,
}

impl From<&MessageCounts> for Counts {
    fn from(value: &MessageCounts) -> Self {
        Self {
            received: value.received(),
            sent: value.sent(),
        }
    }
}

/// How a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler returned successfully
    Success,
    /// The handler returned an error
    Failure {
        /// Code the error was classified as
        code: Code,
        /// Display of the error
        error: String,
    },
}

/// Everything the [`LoggingInterceptor`] knows about a call.
///
/// Created when the call starts. Outcome, duration and, for streaming calls,
/// message counts are filled in when it ends.
#[derive(Debug, Clone)]
pub struct CallRecord {
    method: String,
    shape: Shape,
    metadata: BTreeMap<String, String>,
    started: Instant,
    duration: Duration,
    outcome: Option<Outcome>,
    counts: Option<Counts>,
}

impl CallRecord {
    /// Start a record for a call that starts now
    pub fn begin(ctx: &CallContext, info: &CallInfo) -> Self {
        Self {
            method: info.method().to_owned(),
            shape: info.shape(),
            metadata: metadata::extract(ctx),
            started: Instant::now(),
            duration: Duration::ZERO,
            outcome: None,
            counts: None,
        }
    }

    /// Complete the record with the result of the call
    pub fn finish<T, E: Classify>(&mut self, res: &Result<T, E>, counts: Option<&MessageCounts>) {
        self.duration = self.started.elapsed();
        self.outcome = Some(match res {
            Ok(_) => Outcome::Success,
            Err(cause) => Outcome::Failure {
                code: cause.code(),
                error: cause.to_string(),
            },
        });
        self.counts = counts.map(Counts::from);
    }

    /// Base name of the method
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Interaction pattern of the call
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Metadata of the call, including the peer address if known
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Time from the start of the call until [`CallRecord::finish`]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The outcome, `None` while the call is running
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Message counts, only for finished streaming calls
    pub fn counts(&self) -> Option<Counts> {
        self.counts
    }

    fn log_start(&self, logger: &impl Logger) {
        let kind = match self.shape {
            Shape::Unary => "unary call",
            _ => "stream",
        };
        logger.info_fmt(format_args!(
            "Starting {kind}: {}, metadata: {:?}",
            self.method, self.metadata
        ));
    }

    fn log_end(&self, logger: &impl Logger) {
        let Some(outcome) = &self.outcome else {
            return;
        };
        let ended = Ended {
            record: self,
            outcome,
        };
        match outcome {
            Outcome::Success => logger.info_fmt(format_args!("{ended}")),
            Outcome::Failure { .. } => logger.error_fmt(format_args!("{ended}")),
        }
    }
}

/// Display of the end record of a call
struct Ended<'a> {
    record: &'a CallRecord,
    outcome: &'a Outcome,
}

impl fmt::Display for Ended<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let CallRecord {
            method,
            shape,
            duration,
            ..
        } = self.record;
        let kind = match shape {
            Shape::Unary => "Unary call",
            _ => "Stream",
        };
        match self.outcome {
            Outcome::Success => write!(f, "{kind} successful: {method}, duration: {duration:?}")?,
            Outcome::Failure { code, error } => write!(
                f,
                "{kind} failed: {method}, code: {code}, error: {error}, duration: {duration:?}"
            )?,
        }
        if shape.is_streaming() {
            let Counts { received, sent } = self.record.counts.unwrap_or_default();
            write!(f, ", received messages: {received}, sent messages: {sent}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Mutex};

    use futures_lite::{stream, StreamExt};
    use futures_util::{FutureExt, SinkExt};

    use super::*;
    use crate::{
        metadata::Metadata,
        server::{race2, RpcServerError, UpdateStream},
        status::Status,
        transport::{
            flume::{FlumeListener, SendError},
            ConnectionErrors, RemoteAddr,
        },
    };

    #[derive(Debug, Default)]
    struct Capture(Mutex<Vec<(&'static str, String)>>);

    impl Capture {
        fn lines(&self) -> Vec<(&'static str, String)> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Logger for Capture {
        fn info(&self, message: &str) {
            self.0.lock().unwrap().push(("INFO", message.to_owned()));
        }

        fn error(&self, message: &str) {
            self.0.lock().unwrap().push(("ERROR", message.to_owned()));
        }
    }

    fn ctx() -> CallContext {
        let md: Metadata = [("x-request-id", "abc")].into_iter().collect();
        CallContext::new(md, Some(RemoteAddr::Mem), None)
    }

    #[tokio::test(start_paused = true)]
    async fn unary_success_and_failure() {
        let logger = Arc::new(Capture::default());
        let interceptor = LoggingInterceptor::new(logger.clone());
        let info = CallInfo::new("/ExampleService/GetUser", Shape::Unary);

        let res = interceptor
            .intercept_unary(&ctx(), &info, 123u32, |id| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, Status>(format!("User {id}"))
            })
            .await;
        assert_eq!(res, Ok("User 123".to_owned()));

        let res = interceptor
            .intercept_unary(&ctx(), &info, 0u32, |_| async {
                Err::<String, _>(Status::not_found("no such user"))
            })
            .await;
        assert_eq!(res, Err(Status::not_found("no such user")));

        let lines = logger.lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            (
                "INFO",
                r#"Starting unary call: GetUser, metadata: {"peer_address": "mem", "x-request-id": "abc"}"#
                    .to_owned()
            )
        );
        assert_eq!(
            lines[1],
            ("INFO", "Unary call successful: GetUser, duration: 5ms".to_owned())
        );
        assert_eq!(lines[3].0, "ERROR");
        assert_eq!(
            lines[3].1,
            "Unary call failed: GetUser, code: NotFound, error: rpc error: code = NotFound desc = no such user, duration: 0ns"
        );
    }

    type Chan = FlumeListener<u64, u64>;

    /// Echoes every update back, then fails if asked to
    struct Echo {
        fail: bool,
    }

    impl StreamHandler<Chan> for Echo {
        type Output = ();
        type Error = Status;

        async fn call<Si, St>(self, mut send: Si, mut recv: St) -> Result<(), Status>
        where
            Si: Sink<u64, Error = crate::transport::flume::SendError> + Send + Unpin,
            St: Stream<Item = Result<u64, crate::transport::flume::RecvError>>
                + Send
                + Unpin
                + 'static,
        {
            while let Some(Ok(item)) = recv.next().await {
                send.send(item)
                    .await
                    .map_err(|e| Status::unavailable(e.to_string()))?;
            }
            if self.fail {
                Err(Status::internal("boom"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn stream_records_counts() {
        let logger = Arc::new(Capture::default());
        let interceptor = LoggingInterceptor::new(logger.clone());
        let info = CallInfo::new("/ExampleService/Chat", Shape::BidiStreaming);

        let mut out = Vec::new();
        let updates = stream::iter(vec![Ok(1), Ok(2), Ok(3)]);
        let res = interceptor
            .intercept_stream::<Chan, _, _, _>(
                &ctx(),
                &info,
                (&mut out).sink_map_err(|_| crate::transport::flume::SendError::Closed),
                updates,
                Echo { fail: false },
            )
            .await;
        assert_eq!(res, Ok(()));
        assert_eq!(out, vec![1, 2, 3]);

        let updates = stream::iter(vec![Ok(7)]);
        let res = interceptor
            .intercept_stream::<Chan, _, _, _>(
                &ctx(),
                &info,
                futures_util::sink::drain()
                    .sink_map_err(|_| crate::transport::flume::SendError::Closed),
                updates,
                Echo { fail: true },
            )
            .await;
        assert_eq!(res, Err(Status::internal("boom")));

        let lines = logger.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].1.starts_with("Starting stream: Chat, metadata: "));
        assert!(lines[1].1.starts_with("Stream successful: Chat, duration: "));
        assert!(lines[1]
            .1
            .ends_with(", received messages: 3, sent messages: 3"));
        assert_eq!(lines[3].0, "ERROR");
        assert!(lines[3]
            .1
            .starts_with("Stream failed: Chat, code: Internal, error: rpc error: code = Internal desc = boom, duration: "));
        assert!(lines[3]
            .1
            .ends_with(", received messages: 1, sent messages: 1"));
    }

    /// A channel whose receive side can fail
    #[derive(Debug, Clone)]
    struct Lossy;

    impl ConnectionErrors for Lossy {
        type SendError = SendError;
        type RecvError = io::Error;
        type OpenError = io::Error;
        type AcceptError = io::Error;
    }

    impl StreamTypes for Lossy {
        type In = u64;
        type Out = u64;
        type RecvStream = stream::Iter<std::vec::IntoIter<Result<u64, io::Error>>>;
        type SendSink = crate::transport::flume::SendSink<u64>;
    }

    /// Adds up the updates, the way client streaming calls read them
    struct Sum;

    impl StreamHandler<Lossy> for Sum {
        type Output = u64;
        type Error = RpcServerError<Lossy>;

        async fn call<Si, St>(self, _send: Si, recv: St) -> Result<u64, RpcServerError<Lossy>>
        where
            Si: Sink<u64, Error = SendError> + Send + Unpin,
            St: Stream<Item = Result<u64, io::Error>> + Send + Unpin + 'static,
        {
            let (updates, read_error) = UpdateStream::<Lossy, u64>::new(recv);
            race2(
                read_error.map(Err),
                updates.fold(0, |sum, x| sum + x).map(Ok),
            )
            .await
        }
    }

    #[tokio::test]
    async fn stream_recv_error_is_unavailable() {
        let logger = Arc::new(Capture::default());
        let interceptor = LoggingInterceptor::new(logger.clone());
        let info = CallInfo::new("/ExampleService/UploadFile", Shape::ClientStreaming);

        let updates = stream::iter(vec![
            Ok(1),
            Ok(2),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(3),
        ]);
        let res = interceptor
            .intercept_stream::<Lossy, _, _, _>(
                &ctx(),
                &info,
                futures_util::sink::drain().sink_map_err(|_| SendError::Closed),
                updates,
                Sum,
            )
            .await;
        assert!(matches!(res, Err(RpcServerError::RecvError(_))), "{res:?}");

        let lines = logger.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].0, "ERROR");
        assert!(
            lines[1]
                .1
                .starts_with("Stream failed: UploadFile, code: Unavailable, error: RecvError("),
            "{}",
            lines[1].1
        );
        assert!(lines[1]
            .1
            .ends_with(", received messages: 2, sent messages: 0"));
    }

    #[test]
    fn record_before_finish_has_no_outcome() {
        let record = CallRecord::begin(&ctx(), &CallInfo::new("/S/M", Shape::ServerStreaming));
        assert_eq!(record.method(), "M");
        assert!(record.outcome().is_none());
        assert!(record.counts().is_none());
        assert_eq!(record.metadata()["peer_address"], "mem");
    }
}
