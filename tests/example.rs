use std::{result, time::Duration};

use async_stream::stream;
use derive_more::{From, TryInto};
use futures_lite::{Stream, StreamExt};
use rpc_observe::{
    interceptor::{StreamInterceptor, UnaryInterceptor},
    message::{
        BidiStreaming, BidiStreamingMsg, ClientStreaming, ClientStreamingMsg, Msg, RpcMsg,
        ServerStreaming, ServerStreamingMsg,
    },
    server::{RpcChannel, RpcServerError},
    transport::StreamTypes,
    CallContext, Reply, Service, Status,
};
use serde::{Deserialize, Serialize};

/// look up a user by id
#[derive(Debug, Serialize, Deserialize)]
pub struct GetUser {
    pub id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
}

/// subscribe to the prices of a symbol
#[derive(Debug, Serialize, Deserialize)]
pub struct GetPriceUpdates {
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
}

/// upload a file as a stream of chunks
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadFile {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileChunk {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadStatus {
    pub message: String,
    pub total_size: u64,
}

/// chat with the server, every message gets an answer
#[derive(Debug, Serialize, Deserialize)]
pub struct Chat;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub user: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            content: content.into(),
        }
    }
}

/// request enum
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum ExampleRequest {
    GetUser(GetUser),
    GetPriceUpdates(GetPriceUpdates),
    UploadFile(UploadFile),
    FileChunk(FileChunk),
    Chat(Chat),
    ChatMessage(ChatMessage),
}

/// response enum
#[derive(Debug, Serialize, Deserialize, From, TryInto)]
pub enum ExampleResponse {
    User(User),
    PriceUpdate(PriceUpdate),
    UploadStatus(UploadStatus),
    ChatMessage(ChatMessage),
}

#[derive(Debug, Clone)]
pub struct ExampleService {
    /// time between two price updates
    pub price_interval: Duration,
    /// time a user lookup takes
    pub lookup_delay: Duration,
}

impl Default for ExampleService {
    fn default() -> Self {
        Self {
            price_interval: Duration::from_secs(1),
            lookup_delay: Duration::ZERO,
        }
    }
}

impl Service for ExampleService {
    type Req = ExampleRequest;
    type Res = ExampleResponse;
}

impl RpcMsg<ExampleService> for GetUser {
    type Response = User;
}

impl Msg<ExampleService> for GetPriceUpdates {
    type Pattern = ServerStreaming;
}

impl ServerStreamingMsg<ExampleService> for GetPriceUpdates {
    type Response = PriceUpdate;
}

impl Msg<ExampleService> for UploadFile {
    type Pattern = ClientStreaming;
}

impl ClientStreamingMsg<ExampleService> for UploadFile {
    type Update = FileChunk;
    type Response = UploadStatus;
}

impl Msg<ExampleService> for Chat {
    type Pattern = BidiStreaming;
}

impl BidiStreamingMsg<ExampleService> for Chat {
    type Update = ChatMessage;
    type Response = ChatMessage;
}

impl ExampleService {
    async fn get_user(self, _ctx: CallContext, req: GetUser) -> result::Result<User, Status> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
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
    ) -> impl Stream<Item = result::Result<PriceUpdate, Status>> + Send {
        let interval = self.price_interval;
        stream! {
            for i in 0..5u32 {
                if i > 0 {
                    tokio::time::sleep(interval).await;
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
        _req: UploadFile,
        chunks: impl Stream<Item = FileChunk> + Send,
    ) -> result::Result<UploadStatus, Status> {
        let mut total_size = 0u64;
        tokio::pin!(chunks);
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
    ) -> impl Stream<Item = result::Result<ChatMessage, Status>> + Send {
        messages.map(|msg| {
            Ok(ChatMessage::new(
                "server",
                format!("Server received: {}", msg.content),
            ))
        })
    }

    pub async fn handle_rpc_request<C, U, T>(
        self,
        req: ExampleRequest,
        chan: RpcChannel<ExampleService, C, U, T>,
    ) -> result::Result<(), RpcServerError<C>>
    where
        C: StreamTypes<In = ExampleRequest, Out = Reply<ExampleResponse>>,
        U: UnaryInterceptor,
        T: StreamInterceptor,
    {
        match req {
            ExampleRequest::GetUser(msg) => chan.rpc(msg, self, Self::get_user).await,
            ExampleRequest::GetPriceUpdates(msg) => {
                chan.server_streaming(msg, self, Self::price_updates).await
            }
            ExampleRequest::UploadFile(msg) => {
                chan.client_streaming(msg, self, Self::upload_file).await
            }
            ExampleRequest::Chat(msg) => chan.bidi_streaming(msg, self, Self::chat).await,
            ExampleRequest::FileChunk(_) | ExampleRequest::ChatMessage(_) => {
                Err(RpcServerError::UnexpectedStartMessage)
            }
        }
    }
}
