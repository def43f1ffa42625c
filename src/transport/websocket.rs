use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    oneshot,
};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::bucket::Bucket;

/// How long the write half gets to flush a close frame before it is aborted.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Close code reported when the connection dies without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEventKind {
    Open,
    Message(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
    Error(String),
}

/// Something that happened on one connection, tagged with the connection's
/// generation so the owner can ignore sockets it already replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub generation: u64,
    pub kind: SocketEventKind,
}

/// Owner-side handle of one WebSocket connection.
pub struct Connection {
    generation: u64,
    tx: UnboundedSender<Message>,
    cancel: CancellationToken,
    closing: bool,
}

impl Connection {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues a frame on the write half. Fails once the writer is gone.
    pub fn send(&self, msg: Message) -> Result<(), Message> {
        self.tx.send(msg).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }

    /// A connection with no socket behind it; frames land on the returned
    /// receiver.
    #[cfg(test)]
    pub(crate) fn detached(generation: u64) -> (Self, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let connection = Self {
            generation,
            tx,
            cancel: CancellationToken::new(),
            closing: false,
        };
        (connection, rx)
    }

    /// Sends a close frame and tears the connection down shortly after.
    pub fn close(mut self, code: u16, reason: &str) {
        self.closing = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(WRITE_TASK_SHUTDOWN_MS)).await;
            cancel.cancel();
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closing {
            self.cancel.cancel();
        }
    }
}

/// An encoded frame waiting in a send bucket.
pub struct PendingSend {
    pub message: Message,
    /// Fired once the frame reached the connection's write queue.
    pub done: Option<oneshot::Sender<()>>,
}

impl PendingSend {
    pub fn new(message: Message, done: Option<oneshot::Sender<()>>) -> Self {
        Self { message, done }
    }
}

/// Drains `bucket` into `connection`. Without a live connection the head task
/// is kept and the bucket stays locked until the next unlock.
pub fn flush_bucket(
    bucket: &mut Bucket<PendingSend>,
    connection: Option<&Connection>,
    now: Instant,
) -> usize {
    bucket.shift(now, |task| {
        let Some(connection) = connection.filter(|c| !c.is_closed()) else {
            return Err(task);
        };
        match connection.send(task.message) {
            Ok(()) => {
                if let Some(done) = task.done {
                    let _ = done.send(());
                }
                Ok(())
            }
            Err(message) => Err(PendingSend {
                message,
                done: task.done,
            }),
        }
    })
}

/// Opens connections for a socket owner.
pub trait Dialer: Send {
    fn dial(&mut self, url: Url, generation: u64) -> Connection;
}

/// A dial made by [`RecordingDialer`], with the frames written to it.
#[cfg(test)]
pub(crate) struct Dialed {
    pub url: Url,
    pub generation: u64,
    pub outgoing: UnboundedReceiver<Message>,
}

/// Hands out detached connections and reports every dial.
#[cfg(test)]
pub(crate) struct RecordingDialer(UnboundedSender<Dialed>);

#[cfg(test)]
impl RecordingDialer {
    pub fn new() -> (Self, UnboundedReceiver<Dialed>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

#[cfg(test)]
impl Dialer for RecordingDialer {
    fn dial(&mut self, url: Url, generation: u64) -> Connection {
        let (connection, outgoing) = Connection::detached(generation);
        let _ = self.0.send(Dialed {
            url,
            generation,
            outgoing,
        });
        connection
    }
}

/// Dials real WebSocket connections, reporting on one event channel.
pub struct WsDialer {
    events: UnboundedSender<SocketEvent>,
}

impl WsDialer {
    pub fn new(events: UnboundedSender<SocketEvent>) -> Self {
        Self { events }
    }
}

impl Dialer for WsDialer {
    fn dial(&mut self, url: Url, generation: u64) -> Connection {
        open(url, generation, self.events.clone())
    }
}

/// Opens `url` in the background. Every outcome, including a failed dial, is
/// reported on `events`; the stream always ends with exactly one `Close`.
pub fn open(url: Url, generation: u64, events: UnboundedSender<SocketEvent>) -> Connection {
    let (tx, rx) = unbounded_channel::<Message>();
    let cancel = CancellationToken::new();

    tokio::spawn(run(url, generation, rx, events, cancel.clone()));

    Connection {
        generation,
        tx,
        cancel,
        closing: false,
    }
}

async fn run(
    url: Url,
    generation: u64,
    mut rx: UnboundedReceiver<Message>,
    events: UnboundedSender<SocketEvent>,
    cancel: CancellationToken,
) {
    let emit = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent { generation, kind });
    };

    debug!("Connecting to {}", url);
    let ws_stream = tokio::select! {
        _ = cancel.cancelled() => {
            emit(SocketEventKind::Close { code: ABNORMAL_CLOSE, reason: "Cancelled".into() });
            return;
        }
        res = tokio_tungstenite::connect_async(url.as_str()) => match res {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                emit(SocketEventKind::Error(e.to_string()));
                emit(SocketEventKind::Close { code: ABNORMAL_CLOSE, reason: e.to_string() });
                return;
            }
        }
    };
    emit(SocketEventKind::Open);

    let (mut write, mut read) = ws_stream.split();

    let write_cancel = cancel.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_cancel.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = write.send(msg).await {
                        warn!("WS write error: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            }
        }
    });

    let mut close: Option<(u16, String)> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WS read error: {}", e);
                        emit(SocketEventKind::Error(e.to_string()));
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => emit(SocketEventKind::Message(Bytes::copy_from_slice(text.as_bytes()))),
                    Message::Binary(bin) => emit(SocketEventKind::Message(bin)),
                    Message::Pong(payload) => emit(SocketEventKind::Pong(payload)),
                    Message::Close(frame) => {
                        close = Some(
                            frame
                                .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                                .unwrap_or((1000, String::new())),
                        );
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_millis(WRITE_TASK_SHUTDOWN_MS), write_task).await;

    let (code, reason) = close.unwrap_or((ABNORMAL_CLOSE, String::new()));
    emit(SocketEventKind::Close { code, reason });
}
