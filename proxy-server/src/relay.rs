// proxy-server/src/relay.rs
//! WebSocket relay between a client and the upstream IDE backend.
//!
//! Each session is one actor. Client frames arrive through the actor's
//! `WebsocketContext`, upstream frames through a second stream added to the
//! same context, so both directions are served independently. Writes to the
//! upstream go through a channel to a dedicated sink task, which keeps
//! them in order.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message, StreamHandler};
use actix_http::ws::Item;
use actix_web_actors::ws;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as UpstreamCloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent to the client when the upstream fails or goes quiet.
/// 1011 rather than 1014, which common clients refuse as reserved.
pub const CLOSE_UPSTREAM_FAILED: u16 = 1011;

/// Largest message reassembled from client fragments
const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Events reported back to the session by its upstream writer
#[derive(Message)]
#[rtype(result = "()")]
pub enum RelayEvent {
    UpstreamWriteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    Text,
    Binary,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentError {
    UnexpectedContinuation,
    Interleaved,
    InvalidUtf8,
    TooLarge,
}

/// Reassembles fragmented client messages into whole upstream messages
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    kind: Option<FragmentKind>,
    buf: Vec<u8>,
}

impl FragmentBuffer {
    /// Feed one continuation item. Returns the finished message once the
    /// last fragment arrives.
    pub fn push(&mut self, item: Item) -> Result<Option<WsMessage>, FragmentError> {
        match item {
            Item::FirstText(data) => self.start(FragmentKind::Text, &data)?,
            Item::FirstBinary(data) => self.start(FragmentKind::Binary, &data)?,
            Item::Continue(data) => self.extend(&data)?,
            Item::Last(data) => {
                self.extend(&data)?;
                return self.finish().map(Some);
            }
        }
        Ok(None)
    }

    fn start(&mut self, kind: FragmentKind, data: &[u8]) -> Result<(), FragmentError> {
        if self.kind.is_some() {
            self.reset();
            return Err(FragmentError::Interleaved);
        }
        self.kind = Some(kind);
        self.buf.clear();
        self.append(data)
    }

    fn extend(&mut self, data: &[u8]) -> Result<(), FragmentError> {
        if self.kind.is_none() {
            return Err(FragmentError::UnexpectedContinuation);
        }
        self.append(data)
    }

    fn append(&mut self, data: &[u8]) -> Result<(), FragmentError> {
        if self.buf.len() + data.len() > MAX_MESSAGE_SIZE {
            self.reset();
            return Err(FragmentError::TooLarge);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<WsMessage, FragmentError> {
        let kind = self.kind.take();
        let data = std::mem::take(&mut self.buf);
        match kind {
            Some(FragmentKind::Text) => String::from_utf8(data)
                .map(WsMessage::Text)
                .map_err(|_| FragmentError::InvalidUtf8),
            Some(FragmentKind::Binary) => Ok(WsMessage::Binary(data)),
            None => Err(FragmentError::UnexpectedContinuation),
        }
    }

    fn reset(&mut self) {
        self.kind = None;
        self.buf.clear();
    }
}

impl FragmentError {
    fn close_code(&self) -> ws::CloseCode {
        match self {
            FragmentError::InvalidUtf8 => ws::CloseCode::Invalid,
            FragmentError::TooLarge => ws::CloseCode::Size,
            _ => ws::CloseCode::Protocol,
        }
    }
}

/// Translate a client close reason into the frame sent upstream
fn upstream_close(reason: Option<&ws::CloseReason>) -> WsMessage {
    WsMessage::Close(reason.map(|r| CloseFrame {
        code: UpstreamCloseCode::from(u16::from(r.code)),
        reason: Cow::Owned(r.description.clone().unwrap_or_default()),
    }))
}

/// Translate an upstream close frame into the reason sent to the client
fn client_close(frame: Option<CloseFrame<'_>>) -> Option<ws::CloseReason> {
    frame.map(|f| ws::CloseReason {
        code: ws::CloseCode::from(u16::from(f.code)),
        description: if f.reason.is_empty() {
            None
        } else {
            Some(f.reason.into_owned())
        },
    })
}

fn upstream_failed(description: &str) -> Option<ws::CloseReason> {
    Some(ws::CloseReason {
        code: ws::CloseCode::from(CLOSE_UPSTREAM_FAILED),
        description: Some(description.to_string()),
    })
}

/// One relayed WebSocket session
pub struct RelaySession {
    id: Uuid,
    upstream: Option<UpstreamSocket>,
    upstream_tx: Option<mpsc::Sender<WsMessage>>,
    max_pending: usize,
    fragments: FragmentBuffer,
    last_client_activity: Instant,
    last_upstream_activity: Instant,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
}

impl RelaySession {
    pub fn new(
        id: Uuid,
        upstream: UpstreamSocket,
        heartbeat_interval: Duration,
        idle_timeout: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            id,
            upstream: Some(upstream),
            upstream_tx: None,
            max_pending,
            fragments: FragmentBuffer::default(),
            last_client_activity: Instant::now(),
            last_upstream_activity: Instant::now(),
            heartbeat_interval,
            idle_timeout,
        }
    }

    /// Queue a message for the upstream writer. A full queue means the
    /// upstream is not keeping up with this client; the session is closed
    /// with 1013 rather than dropping or buffering without bound.
    fn send_upstream(&mut self, msg: WsMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let tx = match &self.upstream_tx {
            Some(tx) => tx,
            None => return,
        };
        let closing = matches!(msg, WsMessage::Close(_));

        match tx.try_send(msg) {
            Ok(()) => {}
            // The writer has exited and reports that itself
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) if closing => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "[{}] Upstream backlog exceeded {} messages",
                    self.id,
                    self.max_pending
                );
                self.upstream_tx = None;
                self.shutdown(
                    Some(ws::CloseReason {
                        code: ws::CloseCode::Again,
                        description: Some("upstream backlog".to_string()),
                    }),
                    ctx,
                );
            }
        }
    }

    /// Close the client side and end the session. Dropping the actor drops
    /// the upstream stream and sender, which tears the upstream down too.
    fn shutdown(&mut self, reason: Option<ws::CloseReason>, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.close(reason);
        ctx.stop();
    }

    // Ping both peers and drop the session if either has gone quiet
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            let now = Instant::now();

            if now.duration_since(act.last_client_activity) > act.idle_timeout {
                tracing::warn!("[{}] Client heartbeat timeout", act.id);
                act.send_upstream(
                    WsMessage::Close(Some(CloseFrame {
                        code: UpstreamCloseCode::Away,
                        reason: Cow::Borrowed("client timed out"),
                    })),
                    ctx,
                );
                act.shutdown(None, ctx);
                return;
            }

            if now.duration_since(act.last_upstream_activity) > act.idle_timeout {
                tracing::warn!("[{}] Upstream heartbeat timeout", act.id);
                act.shutdown(upstream_failed("upstream timed out"), ctx);
                return;
            }

            ctx.ping(b"");
            act.send_upstream(WsMessage::Ping(Vec::new()), ctx);
        });
    }
}

/// Drain the channel into the upstream socket until the session ends
async fn write_upstream(
    id: Uuid,
    mut sink: SplitSink<UpstreamSocket, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
    session: Addr<RelaySession>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            tracing::warn!("[{}] Error sending to upstream: {}", id, e);
            session.do_send(RelayEvent::UpstreamWriteFailed(e.to_string()));
            return;
        }
        if closing {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!("[{}] Upstream close: {}", id, e);
    }
    tracing::debug!("[{}] Upstream writer finished", id);
}

impl Actor for RelaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let upstream = match self.upstream.take() {
            Some(upstream) => upstream,
            None => {
                ctx.stop();
                return;
            }
        };

        tracing::info!("[{}] Relay started", self.id);

        let (sink, stream) = upstream.split();
        let (tx, rx) = mpsc::channel(self.max_pending);
        self.upstream_tx = Some(tx);

        ctx.add_stream(stream);
        actix::spawn(write_upstream(self.id, sink, rx, ctx.address()));

        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.upstream_tx = None;
        tracing::info!("[{}] Relay stopped", self.id);
    }
}

/// Client → upstream
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_client_activity = Instant::now();

        match msg {
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => {
                self.send_upstream(WsMessage::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.send_upstream(WsMessage::Binary(data.to_vec()), ctx);
            }
            Ok(ws::Message::Continuation(item)) => match self.fragments.push(item) {
                Ok(Some(message)) => self.send_upstream(message, ctx),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("[{}] Bad fragmented message from client: {:?}", self.id, e);
                    let reason = ws::CloseReason {
                        code: e.close_code(),
                        description: None,
                    };
                    self.send_upstream(upstream_close(Some(&reason)), ctx);
                    self.shutdown(Some(reason), ctx);
                }
            },
            Ok(ws::Message::Close(reason)) => {
                if let Some(r) = &reason {
                    tracing::debug!(
                        "[{}] Client requested close: code={:?}, reason={:?}",
                        self.id,
                        r.code,
                        r.description
                    );
                }
                self.send_upstream(upstream_close(reason.as_ref()), ctx);
                self.shutdown(reason, ctx);
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!("[{}] Client protocol error: {}", self.id, e);
                let reason = ws::CloseReason {
                    code: ws::CloseCode::Protocol,
                    description: None,
                };
                self.send_upstream(upstream_close(Some(&reason)), ctx);
                self.shutdown(Some(reason), ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("[{}] Client stream ended", self.id);
        self.send_upstream(WsMessage::Close(None), ctx);
        ctx.stop();
    }
}

/// Upstream → client
impl StreamHandler<Result<WsMessage, WsError>> for RelaySession {
    fn handle(&mut self, msg: Result<WsMessage, WsError>, ctx: &mut Self::Context) {
        self.last_upstream_activity = Instant::now();

        match msg {
            Ok(WsMessage::Text(text)) => ctx.text(text),
            Ok(WsMessage::Binary(data)) => ctx.binary(data),
            // Pings are answered by the upstream socket itself
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                tracing::debug!("[{}] Upstream closed: {:?}", self.id, frame);
                self.shutdown(client_close(frame), ctx);
            }
            Ok(WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::warn!("[{}] Upstream error: {}", self.id, e);
                self.shutdown(upstream_failed("upstream error"), ctx);
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!("[{}] Upstream stream ended", self.id);
        self.shutdown(upstream_failed("upstream disconnected"), ctx);
    }
}

impl Handler<RelayEvent> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: RelayEvent, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            RelayEvent::UpstreamWriteFailed(reason) => {
                tracing::warn!("[{}] Upstream connection lost: {}", self.id, reason);
                self.shutdown(upstream_failed("upstream connection lost"), ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::web::Bytes;

    #[test]
    fn test_fragments_reassemble_text() {
        let mut buffer = FragmentBuffer::default();
        assert_eq!(buffer.push(Item::FirstText(Bytes::from_static(b"hel"))), Ok(None));
        assert_eq!(buffer.push(Item::Continue(Bytes::from_static(b"lo "))), Ok(None));
        assert_eq!(
            buffer.push(Item::Last(Bytes::from_static(b"world"))),
            Ok(Some(WsMessage::Text("hello world".to_string())))
        );
    }

    #[test]
    fn test_fragments_reassemble_binary() {
        let mut buffer = FragmentBuffer::default();
        buffer.push(Item::FirstBinary(Bytes::from_static(&[1, 2]))).unwrap();
        assert_eq!(
            buffer.push(Item::Last(Bytes::from_static(&[3]))),
            Ok(Some(WsMessage::Binary(vec![1, 2, 3])))
        );
        // buffer is reusable after a finished message
        buffer.push(Item::FirstText(Bytes::from_static(b"a"))).unwrap();
        assert_eq!(
            buffer.push(Item::Last(Bytes::new())),
            Ok(Some(WsMessage::Text("a".to_string())))
        );
    }

    #[test]
    fn test_continuation_without_start_is_rejected() {
        let mut buffer = FragmentBuffer::default();
        assert_eq!(
            buffer.push(Item::Continue(Bytes::from_static(b"x"))),
            Err(FragmentError::UnexpectedContinuation)
        );
        assert_eq!(
            buffer.push(Item::Last(Bytes::from_static(b"x"))),
            Err(FragmentError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_interleaved_start_is_rejected() {
        let mut buffer = FragmentBuffer::default();
        buffer.push(Item::FirstText(Bytes::from_static(b"a"))).unwrap();
        assert_eq!(
            buffer.push(Item::FirstBinary(Bytes::from_static(b"b"))),
            Err(FragmentError::Interleaved)
        );
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let mut buffer = FragmentBuffer::default();
        buffer.push(Item::FirstText(Bytes::from_static(&[0xff]))).unwrap();
        let err = buffer.push(Item::Last(Bytes::from_static(&[0xfe]))).unwrap_err();
        assert_eq!(err, FragmentError::InvalidUtf8);
        assert_eq!(err.close_code(), ws::CloseCode::Invalid);
    }

    #[test]
    fn test_close_codes_survive_translation() {
        let reason = ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some("bye".to_string()),
        };
        match upstream_close(Some(&reason)) {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason, "bye");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let frame = CloseFrame {
            code: UpstreamCloseCode::from(4001),
            reason: Cow::Borrowed(""),
        };
        let reason = client_close(Some(frame)).unwrap();
        assert_eq!(u16::from(reason.code), 4001);
        assert_eq!(reason.description, None);
    }

    #[test]
    fn test_upstream_failure_is_not_a_normal_close() {
        let reason = upstream_failed("upstream error").unwrap();
        assert_eq!(u16::from(reason.code), CLOSE_UPSTREAM_FAILED);
    }
}
