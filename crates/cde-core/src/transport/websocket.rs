//! WebSocket transport: one frame per binary message

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{FrameSink, FrameSource, Transport};
use crate::error::TransportError;

/// Transport over an established WebSocket
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

/// Open a WebSocket to `url` (for example `ws://host:9000/serve`)
pub async fn connect_websocket(
    url: &str,
) -> Result<WsTransport<MaybeTlsStream<TcpStream>>, TransportError> {
    let (stream, response) = tokio_tungstenite::connect_async(url).await?;
    tracing::debug!(
        "WebSocket connected to {} (status {})",
        url,
        response.status()
    );
    Ok(WsTransport::new(stream))
}

/// Complete the server side of a WebSocket handshake on an accepted socket
///
/// Requests for any path other than `path` are answered with 404.
pub async fn accept_websocket(
    socket: TcpStream,
    path: &str,
) -> Result<WsTransport<TcpStream>, TransportError> {
    let expected_path = path.to_string();
    let callback = move |req: &Request, response: Response| {
        let requested = req.uri().path();
        if requested == expected_path || requested == format!("{}/", expected_path) {
            Ok(response)
        } else {
            tracing::warn!("Rejecting WebSocket upgrade for path {}", requested);
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let stream = tokio_tungstenite::accept_hdr_async(socket, callback).await?;
    Ok(WsTransport::new(stream))
}

/// Write half of a [`WsTransport`]
pub struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

/// Read half of a [`WsTransport`]
pub struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = WsSink<S>;
    type Source = WsSource<S>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.stream.split();
        (WsSink { sink }, WsSource { stream })
    }
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match self.sink.send(WsMessage::Binary(frame.to_vec())).await {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Err(TransportError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!("WebSocket closed by peer: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::warn!("Ignoring {} byte text message on tunnel", text.len());
                }
                // Ping/pong replies are handled inside tungstenite
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }
}
