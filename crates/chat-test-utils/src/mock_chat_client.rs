use std::collections::VecDeque;

use chat_protocol::{AuthRequest, AuthResult, Envelope, MessageType};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A close frame observed from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedClose {
    pub code: u16,
    pub reason: String,
}

/// Test client speaking the newline-separated envelope protocol.
pub struct MockChatClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    buffered: VecDeque<Envelope>,
}

impl MockChatClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            buffered: VecDeque::new(),
        })
    }

    /// Sends the `auth` envelope and waits for the positive response.
    pub async fn authenticate(&mut self, token: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.send_envelope(&Envelope::new(
            MessageType::Auth,
            &AuthRequest {
                token: token.to_owned(),
            },
        )?)
        .await?;
        let reply = self.recv_envelope().await?;
        if reply.message_type != MessageType::Auth {
            return Err(format!("expected auth reply, got {}", reply.message_type).into());
        }
        let result: AuthResult = reply.decode_payload()?;
        if !result.authenticated {
            return Err("server did not authenticate".into());
        }
        Ok(())
    }

    pub async fn send_envelope(
        &mut self,
        envelope: &Envelope,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_raw(&envelope.to_json()?).await
    }

    /// Sends raw frame text; lets tests exercise malformed and batched input.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(text.to_owned().into()))
            .await?;
        Ok(())
    }

    /// Next envelope, transparently splitting newline-batched frames and
    /// answering pings via the transport.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        loop {
            if let Some(envelope) = self.buffered.pop_front() {
                return Ok(envelope);
            }
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    for line in text.split('\n') {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        self.buffered.push_back(Envelope::from_json(line)?);
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Reads until the server closes; returns the close frame if one was
    /// sent.  Buffered and in-flight envelopes are discarded.
    pub async fn recv_close(&mut self) -> Result<Option<ObservedClose>, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| ObservedClose {
                        code: f.code.into(),
                        reason: f.reason.to_string(),
                    }));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
