//! Built in transports for rpc-observe
//!
//! There are two sides to a transport, a server side where channels are
//! accepted and a client side where channels are opened.
//!
//! Channels are bidirectional typed streams, with a distinct type for
//! the send and receive side. They are *unrelated* to services.
//!
//! In the transport module, the message types are referred to as `In` and `Out`.
//!
//! A [`Connector`] can be used to *open* bidirectional typed channels using
//! [`Connector::open`]. A [`Listener`] can be used to *accept* bidirectional
//! typed channels from any of the currently connected clients, using
//! [`Listener::accept`].
//!
//! Every channel carries one call. The client attaches a [`CallHeader`] when it
//! opens the channel, and the listener hands it out, together with the address
//! of the peer if known, as part of an [`Incoming`] channel.
//!
//! Errors for both sides are defined by implementing the [`ConnectionErrors`] trait.
use std::{
    fmt::{self, Debug, Display},
    net::SocketAddr,
    time::Duration,
};

use futures_lite::{Future, Stream};
use futures_sink::Sink;
use serde::{Deserialize, Serialize};

use crate::{metadata::Metadata, RpcError, RpcMessage};

#[cfg(feature = "flume-transport")]
#[cfg_attr(rpcobserve_docsrs, doc(cfg(feature = "flume-transport")))]
pub mod flume;

/// Errors that can happen when creating and using a [`Connector`] or [`Listener`].
pub trait ConnectionErrors: Debug + Clone + Send + Sync + 'static {
    /// Error when sending a message via a channel
    type SendError: RpcError;
    /// Error when receiving a message via a channel
    type RecvError: RpcError;
    /// Error when opening a channel
    type OpenError: RpcError;
    /// Error when accepting a channel
    type AcceptError: RpcError;
}

/// Types that are common to both [`Connector`] and [`Listener`].
///
/// Having this as a separate trait is useful when writing generic code that works with both.
pub trait StreamTypes: ConnectionErrors {
    /// The type of messages that can be received on the channel
    type In: RpcMessage;
    /// The type of messages that can be sent on the channel
    type Out: RpcMessage;
    /// Receive side of a bidirectional typed channel
    ///
    /// `None` means the peer has closed its send side. It is not an error.
    type RecvStream: Stream<Item = Result<Self::In, Self::RecvError>>
        + Send
        + Sync
        + Unpin
        + 'static;
    /// Send side of a bidirectional typed channel
    ///
    /// Closing the sink half-closes the channel.
    type SendSink: Sink<Self::Out, Error = Self::SendError> + Send + Sync + Unpin + 'static;
}

/// A connection to a specific remote machine
///
/// A connection can be used to open bidirectional typed channels using [`Connector::open`].
pub trait Connector: StreamTypes {
    /// Open a channel to the remote, attaching the given header
    fn open(
        &self,
        header: CallHeader,
    ) -> impl Future<Output = Result<(Self::SendSink, Self::RecvStream), Self::OpenError>> + Send;
}

/// A listener that listens for connections
///
/// A listener can be used to accept bidirectional typed channels from any of the
/// currently opened connections to clients, using [`Listener::accept`].
pub trait Listener: StreamTypes {
    /// Accept a new typed bidirectional channel on any of the connections we
    /// have currently opened.
    fn accept(&self) -> impl Future<Output = Result<Incoming<Self>, Self::AcceptError>> + Send;

    /// The local addresses this endpoint is bound to.
    fn local_addr(&self) -> &[LocalAddr];
}

/// Information a client sends along when opening a channel for a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    /// Caller supplied metadata
    pub metadata: Metadata,
    /// Time the server has to complete the call, measured from when it accepts it
    pub timeout: Option<Duration>,
}

/// A channel accepted by a [`Listener`]
pub struct Incoming<L: StreamTypes + ?Sized> {
    /// Header sent by the client when opening the channel
    pub header: CallHeader,
    /// Address of the client, if the transport knows it
    pub peer: Option<RemoteAddr>,
    /// Sink to send messages to the client
    pub send: L::SendSink,
    /// Stream of messages from the client
    pub recv: L::RecvStream,
}

impl<L: StreamTypes + ?Sized> fmt::Debug for Incoming<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("header", &self.header)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// The kinds of local addresses a [Listener] can be bound to.
///
/// Returned by [Listener::local_addr].
///
/// [`Display`]: fmt::Display
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum LocalAddr {
    /// A local socket.
    Socket(SocketAddr),
    /// An in-memory address.
    Mem,
}

impl Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LocalAddr::Socket(sockaddr) => write!(f, "{sockaddr}"),
            LocalAddr::Mem => write!(f, "mem"),
        }
    }
}

/// The address of the peer of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteAddr {
    /// A remote socket.
    Socket(SocketAddr),
    /// An in-memory peer.
    Mem,
}

impl Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RemoteAddr::Socket(sockaddr) => write!(f, "{sockaddr}"),
            RemoteAddr::Mem => write!(f, "mem"),
        }
    }
}
