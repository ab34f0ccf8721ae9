//! Framing codecs for the worker socket.
//!
//! Incoming signals are bare 4-byte big-endian integers; outgoing frames are
//! the 5-byte write notification and the 1-byte read confirmation. Works
//! over any AsyncRead/AsyncWrite (sockets, in-memory duplex pairs).

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{CONTINUATION, Frame, SIGNAL_LAST};

/// Decodes the worker's 4-byte big-endian control integers.
#[derive(Debug, Default)]
pub struct SignalCodec;

impl Decoder for SignalCodec {
    type Item = i32;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<i32>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        Ok(Some(src.get_i32()))
    }
}

/// Encodes bridge-to-worker frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            Frame::Buffer { size, has_next } => {
                let size = i32::try_from(size).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "buffer size exceeds the frame size limit",
                    )
                })?;
                dst.reserve(5);
                dst.put_i32(size);
                dst.put_u8(if has_next { CONTINUATION } else { SIGNAL_LAST });
            }
            Frame::ReadConfirmation => dst.put_u8(0),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_big_endian_signals() {
        let mut codec = SignalCodec;
        let mut buf = BytesMut::from(&[0xff, 0xff, 0xff, 0xfe][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(-2));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_signal_waits_for_more_bytes() {
        let mut codec = SignalCodec;
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x01][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.put_u8(0x2c);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(300));
    }

    #[test]
    fn decodes_back_to_back_signals() {
        let mut codec = SignalCodec;
        let mut buf = BytesMut::new();
        buf.put_i32(-3);
        buf.put_i32(17);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(-3));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(17));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn notification_layout_with_continuation() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Buffer {
                    size: 5,
                    has_next: true,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 5, 0]);
    }

    #[test]
    fn notification_layout_with_last_marker() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Buffer {
                    size: 1024,
                    has_next: false,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 4, 0, 32]);
    }

    #[test]
    fn read_confirmation_is_a_single_zero_byte() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::ReadConfirmation, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_buffer_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                Frame::Buffer {
                    size: i32::MAX as usize + 1,
                    has_next: false,
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
