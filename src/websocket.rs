//! WebSocket framing (RFC 6455).
//!
//! After an upgrade the connection speaks frames instead of HTTP messages.
//! The framer surfaces inbound data messages to the handler as a finite
//! stream that ends when the peer closes, and writes the handler's outbound
//! stream as frames in order. Pings are answered automatically; a close
//! frame is answered with a matching close and ends the session; the end of
//! either stream initiates the close handshake.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::{self, Stream, StreamExt};
use futures_lite::io::BufReader;
use futures_lite::{future, AsyncReadExt, AsyncWriteExt};
use log::{debug, trace};
use sha1::{Digest, Sha1};

use crate::async_socket::AsyncSocket;

/// Largest accepted frame payload.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// Largest accepted message after reassembly.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// A close with an optional code and reason. Sending it from a handler
    /// initiates the close handshake.
    Close(Option<(u16, String)>),
}

/// A boxed stream of messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Maps the inbound message stream to an outbound one.
///
/// The identity function is an echo server:
///
/// ```
/// use tern::{Response, MessageStream};
///
/// let echo = Response::upgrade(|incoming: MessageStream| incoming);
/// ```
pub trait WsHandler: Send + Sync {
    fn messages(&self, incoming: MessageStream) -> MessageStream;
}

impl<F> WsHandler for F
where
    F: Fn(MessageStream) -> MessageStream + Send + Sync,
{
    fn messages(&self, incoming: MessageStream) -> MessageStream {
        self(incoming)
    }
}

/// Errors produced by the frame codec.
#[derive(Debug)]
pub enum WsError {
    /// The peer violated the framing rules.
    Protocol(&'static str),
    /// A frame or message exceeded the configured size.
    TooLarge,
    /// The transport failed.
    Io(io::Error),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Protocol(reason) => write!(f, "websocket protocol error: {}", reason),
            WsError::TooLarge => f.write_str("websocket frame too large"),
            WsError::Io(err) => write!(f, "websocket i/o error: {}", err),
        }
    }
}

impl std::error::Error for WsError {}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> WsError {
        WsError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Opcode, WsError> {
        match bits & 0x0F {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(WsError::Protocol("unknown opcode")),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key
/// (RFC 6455 §4.2.2).
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::encode(hasher.finalize())
}

/// Reads one frame. Client-to-server frames must be masked.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, WsError>
where
    R: futures_lite::io::AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(WsError::Protocol("reserved bits set without extensions"));
    }
    let opcode = Opcode::from_bits(header[0])?;
    let masked = header[1] & 0x80 != 0;
    let short_length = (header[1] & 0x7F) as usize;

    if !masked {
        return Err(WsError::Protocol("client frames must be masked"));
    }
    if opcode.is_control() {
        if !fin {
            return Err(WsError::Protocol("fragmented control frame"));
        }
        if short_length > 125 {
            return Err(WsError::Protocol("oversized control frame"));
        }
    }

    let length = match short_length {
        126 => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes).await?;
            u16::from_be_bytes(bytes) as usize
        }
        127 => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes).await?;
            let length = u64::from_be_bytes(bytes);
            if length > MAX_FRAME_SIZE as u64 {
                return Err(WsError::TooLarge);
            }
            length as usize
        }
        length => length,
    };
    if length > MAX_FRAME_SIZE {
        return Err(WsError::TooLarge);
    }

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[index % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Encodes one frame. Server frames pass `mask: None`; a client masks with
/// the given key.
pub(crate) fn encode_frame(
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(if fin { 0x80 } else { 0x00 } | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        length if length < 126 => frame.push(mask_bit | length as u8),
        length if length <= u16::MAX as usize => {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(length as u16).to_be_bytes());
        }
        length => {
            frame.push(mask_bit | 127);
            frame.extend_from_slice(&(length as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

fn close_payload(close: &Option<(u16, String)>) -> Vec<u8> {
    match close {
        Some((code, reason)) => {
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            payload
        }
        None => Vec::new(),
    }
}

/// Control-path items forwarded from the read loop to the write loop.
enum Ctl {
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

/// Items consumed by the write loop.
enum Outbound {
    Message(Message),
    Ended,
    Ctl(Ctl),
}

/// Runs the framing session until the close handshake completes or the
/// transport fails.
///
/// Takes over the connection's buffered reader so frames the peer pipelined
/// right behind the handshake are not lost.
pub(crate) async fn serve(
    reader: BufReader<AsyncSocket>,
    writer: AsyncSocket,
    handler: Arc<dyn WsHandler>,
) {
    let mut reader = reader;
    let mut writer = writer;

    let (in_tx, in_rx) = mpsc::unbounded::<Message>();
    let (ctl_tx, ctl_rx) = mpsc::unbounded::<Ctl>();
    let outgoing = handler.messages(Box::pin(in_rx));

    let read_loop = async move {
        let mut fragment: Option<(Opcode, Vec<u8>)> = None;
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("websocket read ended: {}", err);
                    return;
                }
            };
            trace!("websocket frame: {:?} ({} bytes)", frame.opcode, frame.payload.len());

            match frame.opcode {
                Opcode::Close => {
                    let _ = ctl_tx.unbounded_send(Ctl::Close(frame.payload));
                    return;
                }
                Opcode::Ping => {
                    if ctl_tx.unbounded_send(Ctl::Pong(frame.payload)).is_err() {
                        return;
                    }
                }
                Opcode::Pong => {}
                Opcode::Text | Opcode::Binary => {
                    if fragment.is_some() {
                        debug!("websocket peer interleaved data frames");
                        return;
                    }
                    if frame.fin {
                        match deliver(&in_tx, frame.opcode, frame.payload) {
                            Delivery::Continue => {}
                            Delivery::InitiateClose => {
                                let _ = ctl_tx.unbounded_send(Ctl::Close(Vec::new()));
                                return;
                            }
                            Delivery::Abort => return,
                        }
                    } else {
                        fragment = Some((frame.opcode, frame.payload));
                    }
                }
                Opcode::Continuation => {
                    let (opcode, mut buffer) = match fragment.take() {
                        Some(fragment) => fragment,
                        None => {
                            debug!("websocket continuation without initial frame");
                            return;
                        }
                    };
                    if buffer.len() + frame.payload.len() > MAX_MESSAGE_SIZE {
                        debug!("websocket message exceeds size limit");
                        return;
                    }
                    buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        match deliver(&in_tx, opcode, buffer) {
                            Delivery::Continue => {}
                            Delivery::InitiateClose => {
                                let _ = ctl_tx.unbounded_send(Ctl::Close(Vec::new()));
                                return;
                            }
                            Delivery::Abort => return,
                        }
                    } else {
                        fragment = Some((opcode, buffer));
                    }
                }
            }
        }
    };

    let write_loop = async move {
        let mut merged = stream::select(
            ctl_rx.map(Outbound::Ctl),
            outgoing
                .map(Outbound::Message)
                .chain(stream::iter(vec![Outbound::Ended])),
        );
        let mut close_sent = false;
        while let Some(item) = merged.next().await {
            let result = match item {
                Outbound::Message(Message::Close(close)) => {
                    if close_sent {
                        continue;
                    }
                    close_sent = true;
                    write_frame(&mut writer, Opcode::Close, &close_payload(&close)).await
                }
                Outbound::Message(message) => {
                    if close_sent {
                        continue;
                    }
                    let (opcode, payload) = match &message {
                        Message::Text(text) => (Opcode::Text, text.as_bytes().to_vec()),
                        Message::Binary(bytes) => (Opcode::Binary, bytes.clone()),
                        Message::Ping(bytes) => (Opcode::Ping, bytes.clone()),
                        Message::Pong(bytes) => (Opcode::Pong, bytes.clone()),
                        Message::Close(_) => unreachable!(),
                    };
                    write_frame(&mut writer, opcode, &payload).await
                }
                Outbound::Ended => {
                    // The handler is done; initiate the close handshake.
                    if close_sent {
                        continue;
                    }
                    close_sent = true;
                    write_frame(&mut writer, Opcode::Close, &close_payload(&Some((1000, String::new())))).await
                }
                Outbound::Ctl(Ctl::Pong(payload)) => {
                    if close_sent {
                        continue;
                    }
                    write_frame(&mut writer, Opcode::Pong, &payload).await
                }
                Outbound::Ctl(Ctl::Close(payload)) => {
                    // Echo the peer's close code back, then terminate.
                    if !close_sent {
                        let echo: Vec<u8> = payload.iter().take(2).copied().collect();
                        let _ = write_frame(&mut writer, Opcode::Close, &echo).await;
                    }
                    return;
                }
            };
            if let Err(err) = result {
                debug!("websocket write ended: {}", err);
                return;
            }
        }
    };

    future::zip(read_loop, write_loop).await;
    debug!("websocket session finished");
}

enum Delivery {
    Continue,
    InitiateClose,
    Abort,
}

fn deliver(in_tx: &mpsc::UnboundedSender<Message>, opcode: Opcode, payload: Vec<u8>) -> Delivery {
    let message = match opcode {
        Opcode::Text => match String::from_utf8(payload) {
            Ok(text) => Message::Text(text),
            Err(_) => {
                debug!("websocket text frame is not valid UTF-8");
                return Delivery::Abort;
            }
        },
        _ => Message::Binary(payload),
    };
    // A dropped inbound stream means the handler cancelled it; initiate the
    // close handshake.
    match in_tx.unbounded_send(message) {
        Ok(()) => Delivery::Continue,
        Err(_) => Delivery::InitiateClose,
    }
}

async fn write_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> io::Result<()>
where
    W: futures_lite::io::AsyncWrite + Unpin,
{
    let frame = encode_frame(true, opcode, payload, None);
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use futures_lite::io::Cursor;

    #[test]
    fn computes_the_rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masked_frames_round_trip() {
        let payload = b"ping".to_vec();
        let bytes = encode_frame(true, Opcode::Text, &payload, Some([0x12, 0x34, 0x56, 0x78]));
        let frame = block_on(read_frame(&mut Cursor::new(bytes))).unwrap();
        assert_eq!(
            frame,
            Frame {
                fin: true,
                opcode: Opcode::Text,
                payload,
            }
        );
    }

    #[test]
    fn extended_length_round_trips() {
        let payload = vec![0xAB; 70_000];
        let bytes = encode_frame(true, Opcode::Binary, &payload, Some([9, 8, 7, 6]));
        let frame = block_on(read_frame(&mut Cursor::new(bytes))).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn server_frames_are_unmasked() {
        let bytes = encode_frame(true, Opcode::Text, b"hi", None);
        assert_eq!(bytes[1] & 0x80, 0);
        // An unmasked frame is a protocol error for a server reading it.
        let result = block_on(read_frame(&mut Cursor::new(bytes)));
        assert!(matches!(result, Err(WsError::Protocol(_))));
    }

    #[test]
    fn rejects_fragmented_control_frames() {
        let mut bytes = encode_frame(false, Opcode::Ping, b"x", Some([1, 2, 3, 4]));
        // Clear FIN on a control frame.
        bytes[0] &= 0x7F;
        let result = block_on(read_frame(&mut Cursor::new(bytes)));
        assert!(matches!(result, Err(WsError::Protocol(_))));
    }
}
