//! Async framed transport over any byte stream.
//!
//! Generic over `AsyncRead + AsyncWrite` so the session runs the same
//! against a `TcpStream` and an in-memory duplex pair in tests.  Framing
//! rules live in `calibre-wire`; this layer does the socket work: length
//! prefix accumulation, exact-length reads, and the raw binary sub-stream
//! used for book bodies.

use calibre_wire::framing::{self, Frame, FramingError, MAX_FRAME_LEN};
use calibre_wire::Opcode;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum TransportError {
    /// Clean close: EOF before the first byte of a frame.
    #[error("connection closed by peer")]
    Closed,
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid frame length prefix")]
    BadLengthPrefix,
    #[error("declared frame length {0} exceeds the limit")]
    Oversized(usize),
    #[error("Frame: {0}")]
    Frame(#[from] FramingError),
}

pub struct FramedTransport<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        FramedTransport { stream }
    }

    /// Read one control-frame payload: ASCII digits up to `[`, then exactly
    /// that many bytes (the returned buffer starts at the `[`).
    ///
    /// EOF before any prefix byte is the peer hanging up (`Closed`); EOF or
    /// garbage anywhere later is an error that ends the session.
    pub async fn recv_payload(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut length: usize = 0;
        let mut digits = 0usize;
        loop {
            let byte = match self.read_byte().await? {
                Some(b) => b,
                None if digits == 0 => return Err(TransportError::Closed),
                None => {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "stream ended inside a length prefix",
                    )));
                }
            };
            match byte {
                b'0'..=b'9' => {
                    length = length * 10 + usize::from(byte - b'0');
                    digits += 1;
                    if length > MAX_FRAME_LEN {
                        return Err(TransportError::Oversized(length));
                    }
                }
                b'[' if digits > 0 && length > 0 => break,
                _ => return Err(TransportError::BadLengthPrefix),
            }
        }
        let mut payload = vec![0u8; length];
        payload[0] = b'[';
        self.stream.read_exact(&mut payload[1..]).await?;
        Ok(payload)
    }

    /// Read and decode one control frame.  The outer error is fatal for the
    /// session; the inner one is a malformed-but-complete frame the caller
    /// answers with an ERROR reply.
    pub async fn recv(&mut self) -> Result<Result<Frame, FramingError>, TransportError> {
        let payload = self.recv_payload().await?;
        Ok(framing::decode(&payload))
    }

    /// Encode and send one control frame.
    pub async fn send<T: Serialize>(
        &mut self,
        opcode: Opcode,
        args: &T,
    ) -> Result<(), TransportError> {
        let packet = framing::encode(opcode, args)?;
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes of a binary sub-stream.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    /// Send raw bytes of a binary sub-stream.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<Option<u8>, std::io::Error> {
        let mut byte = [0u8; 1];
        let n = self.stream.read(&mut byte).await?;
        Ok((n == 1).then_some(byte[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (FramedTransport<tokio::io::DuplexStream>, FramedTransport<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FramedTransport::new(a), FramedTransport::new(b))
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut tx, mut rx) = pair();
        let args = json!({"passwordChallenge": "abc", "n": 3});
        tx.send(Opcode::GetInitializationInfo, &args).await.unwrap();
        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::GetInitializationInfo);
        assert_eq!(frame.args, args);
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (mut tx, mut rx) = pair();
        for i in 0..5 {
            tx.send(Opcode::Ok, &json!({"i": i})).await.unwrap();
        }
        for i in 0..5 {
            let frame = rx.recv().await.unwrap().unwrap();
            assert_eq!(frame.args["i"], i);
        }
    }

    #[tokio::test]
    async fn clean_close_is_reported_as_closed() {
        let (tx, mut rx) = pair();
        drop(tx);
        assert!(matches!(
            rx.recv_payload().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_not_a_clean_close() {
        let (mut a, mut rx) = pair();
        a.stream.write_all(b"12").await.unwrap();
        drop(a);
        assert!(matches!(
            rx.recv_payload().await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_early() {
        let (mut a, mut rx) = pair();
        a.stream.write_all(b"99999999999").await.unwrap();
        assert!(matches!(
            rx.recv_payload().await,
            Err(TransportError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn garbage_prefix_is_rejected() {
        let (mut a, mut rx) = pair();
        a.stream.write_all(b"12x[").await.unwrap();
        assert!(matches!(
            rx.recv_payload().await,
            Err(TransportError::BadLengthPrefix)
        ));
    }

    #[tokio::test]
    async fn missing_length_is_rejected() {
        let (mut a, mut rx) = pair();
        a.stream.write_all(b"[0,{}]").await.unwrap();
        assert!(matches!(
            rx.recv_payload().await,
            Err(TransportError::BadLengthPrefix)
        ));
    }

    #[tokio::test]
    async fn malformed_json_is_a_recoverable_decode_error() {
        let (mut a, mut rx) = pair();
        // Correct framing, broken body.
        a.stream.write_all(b"10[12,{oops]").await.unwrap();
        let decoded = rx.recv().await.unwrap();
        assert!(decoded.is_err());
        // The stream stays usable for the next frame.
        a.send(Opcode::Noop, &json!({})).await.unwrap();
        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Noop);
    }

    #[tokio::test]
    async fn binary_sub_stream_passes_raw_bytes() {
        let (mut tx, mut rx) = pair();
        tx.send_raw(b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        rx.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn binary_bytes_follow_a_control_frame_unframed() {
        let (mut tx, mut rx) = pair();
        tx.send(Opcode::Ok, &json!({"lpath": "x.epub"})).await.unwrap();
        tx.send_raw(b"abc").await.unwrap();
        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.args["lpath"], "x.epub");
        let mut buf = [0u8; 3];
        rx.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}
