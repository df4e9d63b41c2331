//! Runs every interaction pattern against a logging server.
//!
//! The log format is taken from `RPC_LOG_FORMAT` (plain, structured or json).
use std::time::Duration;

use anyhow::Context;
use async_stream::stream;
use derive_more::{From, TryInto};
use futures_lite::{Stream, StreamExt};
use futures_util::SinkExt;
use rpc_observe::{
    interceptor::{LoggingInterceptor, StreamInterceptor, UnaryInterceptor},
    logging::{self, LogFormat},
    message::{
        BidiStreaming, BidiStreamingMsg, ClientStreaming, ClientStreamingMsg, Msg, RpcMsg,
        ServerStreaming, ServerStreamingMsg,
    },
    pattern::bidi_streaming,
    server::{run_server_loop, RpcChannel, RpcServerError},
    transport::{flume, StreamTypes},
    CallContext, Reply, RpcClient, RpcServer, Service, Status,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct GetUser {
    id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    id: i32,
    name: String,
    email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GetPriceUpdates {
    symbol: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PriceUpdate {
    symbol: String,
    price: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadFile {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileChunk {
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadStatus {
    message: String,
    total_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Chat;

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    user: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize, From, TryInto)]
enum ShowcaseRequest {
    GetUser(GetUser),
    GetPriceUpdates(GetPriceUpdates),
    UploadFile(UploadFile),
    FileChunk(FileChunk),
    Chat(Chat),
    ChatMessage(ChatMessage),
}

#[derive(Debug, Serialize, Deserialize, From, TryInto)]
enum ShowcaseResponse {
    User(User),
    PriceUpdate(PriceUpdate),
    UploadStatus(UploadStatus),
    ChatMessage(ChatMessage),
}

#[derive(Debug, Clone)]
struct ShowcaseService;

impl Service for ShowcaseService {
    type Req = ShowcaseRequest;
    type Res = ShowcaseResponse;
}

impl RpcMsg<ShowcaseService> for GetUser {
    type Response = User;
}

impl Msg<ShowcaseService> for GetPriceUpdates {
    type Pattern = ServerStreaming;
}

impl ServerStreamingMsg<ShowcaseService> for GetPriceUpdates {
    type Response = PriceUpdate;
}

impl Msg<ShowcaseService> for UploadFile {
    type Pattern = ClientStreaming;
}

impl ClientStreamingMsg<ShowcaseService> for UploadFile {
    type Update = FileChunk;
    type Response = UploadStatus;
}

impl Msg<ShowcaseService> for Chat {
    type Pattern = BidiStreaming;
}

impl BidiStreamingMsg<ShowcaseService> for Chat {
    type Update = ChatMessage;
    type Response = ChatMessage;
}

impl ShowcaseService {
    async fn get_user(self, _ctx: CallContext, req: GetUser) -> Result<User, Status> {
        if req.id < 0 {
            return Err(Status::not_found(format!("user {} not found", req.id)));
        }
        Ok(User {
            id: req.id,
            name: format!("User {}", req.id),
            email: format!("user{}@example.com", req.id),
        })
    }

    fn price_updates(
        self,
        _ctx: CallContext,
        req: GetPriceUpdates,
    ) -> impl Stream<Item = Result<PriceUpdate, Status>> + Send {
        stream! {
            for i in 0..5u32 {
                if i > 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                yield Ok(PriceUpdate {
                    symbol: req.symbol.clone(),
                    price: 100.0 + f64::from(i),
                });
            }
        }
    }

    async fn upload_file(
        self,
        _ctx: CallContext,
        req: UploadFile,
        chunks: impl Stream<Item = FileChunk> + Send,
    ) -> Result<UploadStatus, Status> {
        tracing::debug!("receiving {}", req.name);
        tokio::pin!(chunks);
        let mut total_size = 0u64;
        while let Some(chunk) = chunks.next().await {
            total_size += chunk.data.len() as u64;
        }
        Ok(UploadStatus {
            message: format!("Upload complete. Total size: {total_size} bytes"),
            total_size,
        })
    }

    fn chat(
        self,
        _ctx: CallContext,
        _req: Chat,
        messages: impl Stream<Item = ChatMessage> + Send,
    ) -> impl Stream<Item = Result<ChatMessage, Status>> + Send {
        messages.map(|msg| {
            Ok(ChatMessage {
                user: "server".into(),
                content: format!("Server received: {}", msg.content),
            })
        })
    }

    async fn handle_rpc_request<C, U, T>(
        self,
        req: ShowcaseRequest,
        chan: RpcChannel<ShowcaseService, C, U, T>,
    ) -> Result<(), RpcServerError<C>>
    where
        C: StreamTypes<In = ShowcaseRequest, Out = Reply<ShowcaseResponse>>,
        U: UnaryInterceptor,
        T: StreamInterceptor,
    {
        match req {
            ShowcaseRequest::GetUser(msg) => chan.rpc(msg, self, Self::get_user).await,
            ShowcaseRequest::GetPriceUpdates(msg) => {
                chan.server_streaming(msg, self, Self::price_updates).await
            }
            ShowcaseRequest::UploadFile(msg) => {
                chan.client_streaming(msg, self, Self::upload_file).await
            }
            ShowcaseRequest::Chat(msg) => chan.bidi_streaming(msg, self, Self::chat).await,
            ShowcaseRequest::FileChunk(_) | ShowcaseRequest::ChatMessage(_) => {
                Err(RpcServerError::UnexpectedStartMessage)
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = LogFormat::from_env()?;
    logging::init(format);
    let logging = LoggingInterceptor::new(logging::logger(format));

    let (listener, connector) = flume::channel(16);
    let server = RpcServer::<ShowcaseService, _>::new(listener)
        .unary_interceptor(logging.clone())
        .stream_interceptor(logging);
    let server_handle = tokio::spawn(run_server_loop(
        server.clone(),
        ShowcaseService,
        |chan, req, service: ShowcaseService| service.handle_rpc_request(req, chan),
    ));

    let client = RpcClient::<ShowcaseService, _>::new(connector)
        .with_metadata("x-request-id", "showcase-1")
        .with_timeout(Duration::from_secs(10));

    // rpc
    let user = client.rpc(GetUser { id: 123 }).await?;
    println!("user: {} <{}> (id {})", user.name, user.email, user.id);
    match client.rpc(GetUser { id: -1 }).await {
        Ok(user) => println!("unexpected user {user:?}"),
        Err(cause) => println!("lookup failed: {cause}"),
    }

    // server streaming
    let mut updates = client
        .server_streaming(GetPriceUpdates {
            symbol: "AAPL".into(),
        })
        .await?;
    while let Some(update) = updates.next().await {
        let update = update?;
        println!("price of {}: {:.2}", update.symbol, update.price);
    }

    // client streaming
    let (mut sink, response) = client
        .client_streaming(UploadFile {
            name: "notes.txt".into(),
        })
        .await?;
    for chunk in ["first chunk", "second", "third!"] {
        sink.send(FileChunk {
            data: chunk.as_bytes().to_vec(),
        })
        .await?;
    }
    sink.close().await?;
    let status = response.await?;
    println!("{} ({} bytes)", status.message, status.total_size);

    // bidi streaming
    let (sink, replies) = client.bidi(Chat).await?;
    let messages = ["hello", "how are you", "bye"].map(|content| ChatMessage {
        user: "alice".into(),
        content: content.into(),
    });
    for reply in bidi_streaming::exchange(sink, replies, messages).await? {
        println!("{}: {}", reply.user, reply.content);
    }

    server.shutdown();
    server_handle
        .await
        .context("server task failed")??;
    Ok(())
}
