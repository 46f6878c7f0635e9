use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::codec::{detect_framing, DecodeResult, FrameCodec, Framing, MAGIC_LEN};
use crate::seq::SeqNum;

/// ```ascii
/// DATA: magic number DATA (u32 BE), seq (u32 BE), payload (rest of the message)
/// ACK:  magic number ACK (u32 BE), seq (u32 BE) - cumulative, i.e. acknowledging all frames
///        up to and including `seq`
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GoBackNFrame {
    Data { seq: SeqNum, payload: Bytes },
    Ack { seq: SeqNum },
}

impl GoBackNFrame {
    pub const MAGIC_DATA: u32 = 0xDB1E_6B01;
    pub const MAGIC_ACK: u32 = 0xDB1E_6B02;
    pub const MIN_LEN: usize = MAGIC_LEN + size_of::<u32>();
}

impl FrameCodec for GoBackNFrame {
    fn ser(&self, buf: &mut BytesMut) {
        match self {
            GoBackNFrame::Data { seq, payload } => {
                buf.put_u32(Self::MAGIC_DATA);
                buf.put_u32(seq.to_raw());
                buf.put_slice(payload);
            }
            GoBackNFrame::Ack { seq } => {
                buf.put_u32(Self::MAGIC_ACK);
                buf.put_u32(seq.to_raw());
            }
        }
    }

    fn deser(buf: &Bytes) -> DecodeResult<Self> {
        match detect_framing(buf, &[(Self::MAGIC_DATA, Self::MIN_LEN), (Self::MAGIC_ACK, Self::MIN_LEN)]) {
            Framing::PassThrough => DecodeResult::PassThrough(buf.clone()),
            Framing::NeedMoreBytes => DecodeResult::NeedMoreBytes,
            Framing::Known(magic) => {
                let seq = SeqNum::from_raw((&buf[MAGIC_LEN..]).get_u32());
                if magic == Self::MAGIC_DATA {
                    DecodeResult::Decoded(GoBackNFrame::Data {
                        seq,
                        payload: buf.slice(Self::MIN_LEN..),
                    })
                }
                else {
                    DecodeResult::Decoded(GoBackNFrame::Ack { seq })
                }
            }
        }
    }
}
