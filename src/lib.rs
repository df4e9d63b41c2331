//! Four rpc interaction patterns with an observability layer
//!
//! Calls are made over a [`transport`] that provides typed bidirectional
//! channels. On top of that, [`RpcClient`] and [`RpcServer`] implement the
//! four interaction patterns in [`pattern`]: rpc, server streaming, client
//! streaming and bidi streaming.
//!
//! Every call accepted by a [`RpcServer`] runs through the interceptors
//! registered on it. The [`interceptor::LoggingInterceptor`] measures the
//! call, classifies its outcome and counts the messages that flow through
//! streaming calls, then writes one record to a [`logging::Logger`].
//!
//! # Example
//! ```
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use rpc_observe::{
//!     interceptor::LoggingInterceptor, logging::StdoutLogger, pattern::rpc::RpcMsg,
//!     RpcClient, RpcServer, Service,
//! };
//! use serde::{Deserialize, Serialize};
//! use derive_more::{From, TryInto};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Ping;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Pong;
//!
//! #[derive(Debug, Serialize, Deserialize, From, TryInto)]
//! enum PingRequest {
//!     Ping(Ping),
//! }
//!
//! #[derive(Debug, Serialize, Deserialize, From, TryInto)]
//! enum PingResponse {
//!     Pong(Pong),
//! }
//!
//! #[derive(Debug, Clone)]
//! struct PingService;
//!
//! impl Service for PingService {
//!     type Req = PingRequest;
//!     type Res = PingResponse;
//! }
//!
//! impl RpcMsg<PingService> for Ping {
//!     type Response = Pong;
//! }
//!
//! let (server, client) = rpc_observe::transport::flume::channel(1);
//! let logging = LoggingInterceptor::new(Arc::new(StdoutLogger::new()));
//! let server = RpcServer::<PingService, _>::new(server)
//!     .unary_interceptor(logging.clone())
//!     .stream_interceptor(logging);
//! tokio::spawn(async move {
//!     let (req, chan) = server.accept().await?.read_first().await?;
//!     match req {
//!         PingRequest::Ping(ping) => chan.rpc(ping, (), |_, _ctx, _ping| async { Ok(Pong) }).await,
//!     }
//! });
//!
//! let client = RpcClient::<PingService, _>::new(client);
//! let _pong = client.rpc(Ping).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
#![doc = document_features::document_features!()]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(rpcobserve_docsrs, feature(doc_cfg))]
use std::fmt::{Debug, Display};

use serde::{de::DeserializeOwned, Serialize};
pub mod client;
pub mod context;
pub mod interceptor;
pub mod logging;
pub mod message;
pub mod metadata;
pub mod server;
pub mod status;
pub mod transport;
pub use client::RpcClient;
pub use context::CallContext;
pub use server::RpcServer;
pub use status::{Code, Status};
pub mod pattern;

/// Requirements for a RPC message
///
/// Even when just using the mem transport, we require messages to be Serializable and Deserializable.
/// Likewise, we require messages to be Send so calls can be handled on their own task.
pub trait RpcMessage: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

impl<T> RpcMessage for T where
    T: Debug + Serialize + DeserializeOwned + Send + Sync + Unpin + 'static
{
}

/// Requirements for an internal error
///
/// All errors have to be Send, Sync and `'static` so they can be sent across threads.
/// They also need to be `Debug` when used with `anyhow!`, and `Display` to be logged.
pub trait RpcError: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static {}

impl<T> RpcError for T where T: Debug + Display + Into<anyhow::Error> + Send + Sync + Unpin + 'static
{}

/// A service
pub trait Service: Send + Sync + Debug + Clone + 'static {
    /// Type of request messages
    type Req: RpcMessage;
    /// Type of response messages
    type Res: RpcMessage;
}

/// A frame sent from the server to the client.
///
/// Every response travels as `Ok`. A call that fails ends with a single `Err`
/// frame carrying the [`Status`], after which the server closes its side.
pub type Reply<T> = std::result::Result<T, Status>;

/// A connector to a specific service
///
/// This is just a trait alias for a [`transport::Connector`] with the right types. It is used
/// to make it easier to specify the bounds of a connector that matches a specific
/// service.
pub trait Connector<S: Service>: transport::Connector<In = Reply<S::Res>, Out = S::Req> {}

impl<T: transport::Connector<In = Reply<S::Res>, Out = S::Req>, S: Service> Connector<S> for T {}

/// A listener for a specific service
///
/// This is just a trait alias for a [`transport::Listener`] with the right types. It is used
/// to make it easier to specify the bounds of a listener that matches a specific
/// service.
pub trait Listener<S: Service>: transport::Listener<In = S::Req, Out = Reply<S::Res>> {}

impl<T: transport::Listener<In = S::Req, Out = Reply<S::Res>>, S: Service> Listener<S> for T {}
