//! Tokio codec for the AMQP frame header layer.
//!
//! The wire frame is `size(u32) doff(u8) type(u8) channel(u16)
//! extended-header body`. `size` covers the whole frame, `doff` is the body
//! offset in 4-byte words. Frame type 0 carries AMQP performatives, type 1
//! carries the SASL bodies; an empty body is a keepalive.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameBody};
use crate::buffer::patch_u32_at;
use crate::error::Error;

/// Minimum legal value for a negotiated max-frame-size.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Bytes of the fixed frame header.
const HEADER_SIZE: usize = 8;

const FRAME_TYPE_AMQP: u8 = 0;
const FRAME_TYPE_SASL: u8 = 1;

/// Decoder enforcing the locally advertised max-frame-size.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames over `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size.max(MIN_MAX_FRAME_SIZE),
        }
    }

    /// Replace the size limit after Open negotiation.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size.max(MIN_MAX_FRAME_SIZE);
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < HEADER_SIZE {
            return Err(Error::MalformedFrame("frame size below header size"));
        }
        if size > self.max_frame_size as usize {
            return Err(Error::FrameTooLarge {
                size: size as u64,
                max: self.max_frame_size,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size);
        frame.advance(4);
        let doff = frame.get_u8() as usize;
        let frame_type = frame.get_u8();
        let channel = frame.get_u16();
        if doff < 2 || doff * 4 > size {
            return Err(Error::MalformedFrame("data offset out of range"));
        }
        if frame_type != FRAME_TYPE_AMQP && frame_type != FRAME_TYPE_SASL {
            return Err(Error::MalformedFrame("unknown frame type"));
        }
        // skip the extended header, if any
        frame.advance(doff * 4 - HEADER_SIZE);

        let body = FrameBody::decode(&frame)?;
        if body.is_sasl() != (frame_type == FRAME_TYPE_SASL) && body != FrameBody::Empty {
            return Err(Error::MalformedFrame("body does not match frame type"));
        }
        log::trace!("RX frame: ch={channel} {}", body.name());
        Ok(Some(Frame { channel, body }))
    }
}

/// Encoder writing frames with a back-patched size field.
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        log::trace!("TX frame: ch={} {}", frame.channel, frame.body.name());
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u8(2); // doff: no extended header
        dst.put_u8(if frame.body.is_sasl() {
            FRAME_TYPE_SASL
        } else {
            FRAME_TYPE_AMQP
        });
        dst.put_u16(frame.channel);
        frame.body.encode(dst)?;

        let size = u32::try_from(dst.len() - start)
            .map_err(|_| crate::encoding::CodecError::ValueTooLarge("frame"))?;
        patch_u32_at(dst, start, size);
        Ok(())
    }
}
