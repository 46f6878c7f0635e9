//! Wire codecs for all frames of the reliable-transport sublayer.
//!
//! Every frame starts with a 4 byte magic number identifying its kind. Input that is too short
//!  to contain a magic number, or that starts with a magic number none of the codecs knows, is
//!  passed through unmodified so that the sublayer can share a channel with other traffic.

pub mod segment;
pub mod stop_and_wait_frame;
pub mod go_back_n_frame;

use bytes::{Buf, Bytes, BytesMut};

pub const MAGIC_LEN: usize = size_of::<u32>();

/// The outcome of a decode attempt. Decoding never fails: input that is not (or not yet) a
///  frame of the codec's family is reported as such, and the input itself is never modified.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult<T> {
    Decoded(T),
    /// The input starts with a known magic number, but it is shorter than the frame's minimum
    ///  length: more bytes are required to decode it.
    NeedMoreBytes,
    /// The input does not belong to this codec, and is handed back for forwarding.
    PassThrough(Bytes),
}

impl<T> DecodeResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DecodeResult<U> {
        match self {
            DecodeResult::Decoded(t) => DecodeResult::Decoded(f(t)),
            DecodeResult::NeedMoreBytes => DecodeResult::NeedMoreBytes,
            DecodeResult::PassThrough(buf) => DecodeResult::PassThrough(buf),
        }
    }
}

pub trait FrameCodec: Sized {
    fn ser(&self, buf: &mut BytesMut);

    fn deser(buf: &Bytes) -> DecodeResult<Self>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

/// `true` if `buf` is a complete frame of any of the sublayer's codecs
pub fn is_frame(buf: &Bytes) -> bool {
    matches!(segment::HandshakeSegment::deser(buf), DecodeResult::Decoded(_))
        || matches!(stop_and_wait_frame::StopAndWaitFrame::deser(buf), DecodeResult::Decoded(_))
        || matches!(go_back_n_frame::GoBackNFrame::deser(buf), DecodeResult::Decoded(_))
}

pub(crate) enum Framing {
    Known(u32),
    NeedMoreBytes,
    PassThrough,
}

/// Minimum length check first, then the magic number: `known` contains pairs of magic number
///  and the minimum length of frames with that magic number (including the magic number).
pub(crate) fn detect_framing(buf: &[u8], known: &[(u32, usize)]) -> Framing {
    if buf.len() < MAGIC_LEN {
        return Framing::PassThrough;
    }

    let magic = (&buf[..MAGIC_LEN]).get_u32();
    match known.iter().find(|(m, _)| *m == magic) {
        None => Framing::PassThrough,
        Some((_, min_len)) if buf.len() < *min_len => Framing::NeedMoreBytes,
        Some(_) => Framing::Known(magic),
    }
}
