//! Single writer per signaling connection.
//!
//! The receive loop and engine callbacks run concurrently and all of them
//! talk to the client. Every frame goes through one queue drained by one
//! task that owns the sink, so frames never interleave.

use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Ack = oneshot::Sender<Result<(), String>>;

enum Command {
    Send(Message, Option<Ack>),
    Finish,
}

#[derive(Debug, thiserror::Error)]
#[error("outbound writer has stopped")]
pub struct WriterGone;

/// Cloneable handle onto a connection's writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Command>,
}

impl Outbound {
    /// Queue a text frame without waiting for it to be written.
    pub fn send_text(&self, text: String) -> Result<(), WriterGone> {
        self.tx
            .send(Command::Send(Message::Text(text.into()), None))
            .map_err(|_| WriterGone)
    }

    /// Queue a text frame and wait until the sink accepted it.
    pub async fn deliver_text(&self, text: String) -> Result<(), String> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Send(Message::Text(text.into()), Some(ack_tx)))
            .map_err(|_| WriterGone.to_string())?;
        ack_rx.await.map_err(|_| WriterGone.to_string())?
    }

    /// Queue a close frame. Nothing queued after it is written.
    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.tx.send(Command::Send(Message::Close(Some(frame)), None));
    }

    /// Ask the writer to flush what is queued so far, close the sink and exit.
    pub fn finish(&self) {
        let _ = self.tx.send(Command::Finish);
    }
}

/// Spawn the writer task. `failed` is cancelled if a write fails.
pub fn spawn_writer<S>(mut sink: S, failed: CancellationToken) -> (Outbound, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let (message, ack) = match command {
                Command::Send(message, ack) => (message, ack),
                Command::Finish => break,
            };
            let closing = matches!(message, Message::Close(_));

            match sink.send(message).await {
                Ok(()) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!("Send failed: {e}");
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(e.to_string()));
                    }
                    failed.cancel();
                    break;
                }
            }

            if closing {
                break;
            }
        }

        // Anything still queued is dropped; senders see `WriterGone` from now on.
        rx.close();
        if let Err(e) = sink.close().await {
            debug!("Closing sink: {e}");
        }
    });

    (Outbound { tx }, handle)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use futures_util::sink;
    use tokio::sync::mpsc::error::SendError;

    use super::*;

    type TestSink = Pin<Box<dyn Sink<Message, Error = SendError<Message>> + Send>>;

    fn capture() -> (TestSink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, message: Message| async move {
            tx.send(message)?;
            Ok::<_, SendError<Message>>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[tokio::test]
    async fn frames_arrive_in_queue_order() {
        let (sink, mut rx) = capture();
        let (out, writer) = spawn_writer(sink, CancellationToken::new());

        out.send_text("one".into()).unwrap();
        out.deliver_text("two".into()).await.unwrap();
        out.send_text("three".into()).unwrap();
        out.finish();
        writer.await.unwrap();

        let mut texts = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            texts.push(text.to_string());
        }
        assert_eq!(texts, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn nothing_is_written_after_close() {
        let (sink, mut rx) = capture();
        let (out, writer) = spawn_writer(sink, CancellationToken::new());

        out.close(CloseCode::Size, "too big");
        out.send_text("late".into()).ok();
        writer.await.unwrap();

        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Size),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert!(out.send_text("after".into()).is_err());
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let sink = sink::unfold((), |(), _message: Message| async {
            Err::<(), _>(std::io::Error::other("broken pipe"))
        });
        let failed = CancellationToken::new();
        let (out, writer) = spawn_writer(Box::pin(sink), failed.clone());

        let err = out.deliver_text("answer".into()).await.unwrap_err();
        assert!(err.contains("broken pipe"));
        writer.await.unwrap();
        assert!(failed.is_cancelled());
    }
}
