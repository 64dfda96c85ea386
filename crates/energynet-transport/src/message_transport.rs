//! Message transport (component 6, §2): serializes
//! [`energynet_wire::Message`]s into frames and sends them over a
//! [`FrameTransport`], and parses received frames back into messages
//! through the registry.

use energynet_wire::{parse, Frame, Message, ParseMode, ParseOutcome};

use crate::frame_transport::FrameTransport;
use crate::{TransportError, TransportResult};

/// One message, decorated with the diagnostics its parse produced
/// (warnings survive a successful lenient parse, §4.3).
#[derive(Debug)]
pub struct ReceivedMessage {
    pub message: Message,
    pub diagnostics: Vec<energynet_diagnostics::Diagnostic>,
}

/// Wraps a [`FrameTransport`] with message-level send/receive (§4.3).
pub struct MessageTransport<T: FrameTransport> {
    inner: T,
    parse_mode: ParseMode,
}

impl<T: FrameTransport> MessageTransport<T> {
    pub fn new(inner: T, parse_mode: ParseMode) -> Self {
        Self { inner, parse_mode }
    }

    pub async fn send(&mut self, message: &Message) -> TransportResult<()> {
        let frame = Frame::new(message.type_id(), message.encode_payload());
        self.inner.send_frame(&frame).await
    }

    /// Receive and parse the next message. `Ok(None)` on clean
    /// transport EOF. A parse failure is reported as
    /// `Ok(Some(ReceivedMessage))` carrying only diagnostics and an
    /// `UnknownMessage` placeholder is never constructed here — callers
    /// distinguishing a hard parse failure from success inspect
    /// `ParseOutcome` directly via [`MessageTransport::recv_outcome`].
    pub async fn recv(&mut self) -> TransportResult<Option<ReceivedMessage>> {
        match self.recv_outcome().await? {
            None => Ok(None),
            Some(ParseOutcome::Success { message, diagnostics }) => {
                Ok(Some(ReceivedMessage { message, diagnostics }))
            }
            Some(ParseOutcome::Failure { diagnostics }) => Err(TransportError::Io(format!(
                "message parse failure: {diagnostics:?}"
            ))),
        }
    }

    /// Receive the next frame and run it through the message registry,
    /// returning the raw [`ParseOutcome`] rather than collapsing failure
    /// into a transport error.
    pub async fn recv_outcome(&mut self) -> TransportResult<Option<ParseOutcome>> {
        let Some(frame) = self.inner.recv_frame().await? else {
            return Ok(None);
        };
        Ok(Some(parse(frame.message_type_id, &frame.payload, self.parse_mode)))
    }

    pub async fn close(&mut self) -> TransportResult<()> {
        self.inner.close().await
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_transport::TcpFrameTransport;
    use energynet_wire::{Message, SoftDisconnect};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (server, _) = listener.accept().await.expect("accept");
        let client = client.await.expect("join").expect("connect");
        (client, server)
    }

    #[tokio::test]
    async fn send_and_receive_message_roundtrip() {
        let (client, server) = connected_pair().await;
        let mut sender = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        let mut receiver =
            MessageTransport::new(TcpFrameTransport::new(server), ParseMode::Lenient);

        let msg = Message::SoftDisconnect(SoftDisconnect {
            reconnect: Some(false),
            reason: Some("normal".into()),
        });
        sender.send(&msg).await.expect("send");

        let received = receiver.recv().await.expect("recv").expect("some message");
        assert_eq!(received.message, msg);
        assert!(received.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn strict_mode_surfaces_unknown_message_as_error() {
        let (client, server) = connected_pair().await;
        let mut sender = MessageTransport::new(TcpFrameTransport::new(client), ParseMode::Lenient);
        let mut receiver =
            MessageTransport::new(TcpFrameTransport::new(server), ParseMode::Strict);

        let frame = Frame::new(0x1234_5678, vec![]);
        sender.inner.send_frame(&frame).await.expect("send");

        let result = receiver.recv().await;
        assert!(result.is_err());
    }
}
