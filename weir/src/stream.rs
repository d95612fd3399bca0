// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

use crate::error::Error;

/// Each Stream represents a duplex socket connection to a client.
///
/// WebSocket frames carry raw MQTT packet bytes; one MQTT packet may span
/// multiple frames and multiple packets may share one frame, so frames are
/// only appended to the read buffer here and reassembled by the session
/// framing loop, identical to TCP.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

impl Stream {
    /// Read some bytes from stream, appending to `buf`.
    ///
    /// Returns 0 when the peer closed the stream.
    ///
    /// # Errors
    ///
    /// Returns error if stream/socket gets error.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => Ok(tcp_stream.read_buf(buf).await?),
            Self::Mqtts(tls_stream) => Ok(tls_stream.read_buf(buf).await?),
            Self::Ws(ws_stream) => loop {
                let Some(msg) = ws_stream.next().await else {
                    return Ok(0);
                };
                let msg = msg?;
                match msg {
                    Message::Binary(data) => {
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    Message::Close(_) => return Ok(0),
                    // Ping/Pong are handled by tungstenite itself.
                    _ => {}
                }
            },
            Self::Wss(wss_stream) => loop {
                let Some(msg) = wss_stream.next().await else {
                    return Ok(0);
                };
                let msg = msg?;
                match msg {
                    Message::Binary(data) => {
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    Message::Close(_) => return Ok(0),
                    _ => {}
                }
            },
        }
    }

    /// Write whole `buf` to stream.
    ///
    /// # Errors
    ///
    /// Returns error if socket/stream gets error.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Mqtt(tcp_stream) => {
                tcp_stream.write_all(buf).await?;
                Ok(buf.len())
            }
            Self::Mqtts(tls_stream) => {
                tls_stream.write_all(buf).await?;
                Ok(buf.len())
            }
            Self::Ws(ws_stream) => {
                let msg = Message::binary(buf.to_vec());
                ws_stream.send(msg).await?;
                Ok(buf.len())
            }
            Self::Wss(wss_stream) => {
                let msg = Message::binary(buf.to_vec());
                wss_stream.send(msg).await?;
                Ok(buf.len())
            }
        }
    }

    /// Close the stream.
    pub async fn close(&mut self) {
        match self {
            Self::Mqtt(tcp_stream) => {
                let _ret = tcp_stream.shutdown().await;
            }
            Self::Mqtts(tls_stream) => {
                let _ret = tls_stream.shutdown().await;
            }
            Self::Ws(ws_stream) => {
                let _ret = ws_stream.close(None).await;
            }
            Self::Wss(wss_stream) => {
                let _ret = wss_stream.close(None).await;
            }
        }
    }
}
