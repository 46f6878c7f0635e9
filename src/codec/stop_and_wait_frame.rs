use bytes::{BufMut, Bytes, BytesMut};
use crate::codec::{detect_framing, DecodeResult, FrameCodec, Framing, MAGIC_LEN};

/// ```ascii
/// DATA: magic number DATA (u32 BE), bit (u8: 0 or 1), payload (rest of the message)
/// ACK:  magic number ACK (u32 BE), bit (u8: 0 or 1)
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopAndWaitFrame {
    Data { bit: bool, payload: Bytes },
    Ack { bit: bool },
}

impl StopAndWaitFrame {
    pub const MAGIC_DATA: u32 = 0xDB1E_5A01;
    pub const MAGIC_ACK: u32 = 0xDB1E_5A02;
    pub const MIN_LEN: usize = MAGIC_LEN + size_of::<u8>();
}

impl FrameCodec for StopAndWaitFrame {
    fn ser(&self, buf: &mut BytesMut) {
        match self {
            StopAndWaitFrame::Data { bit, payload } => {
                buf.put_u32(Self::MAGIC_DATA);
                buf.put_u8(*bit as u8);
                buf.put_slice(payload);
            }
            StopAndWaitFrame::Ack { bit } => {
                buf.put_u32(Self::MAGIC_ACK);
                buf.put_u8(*bit as u8);
            }
        }
    }

    fn deser(buf: &Bytes) -> DecodeResult<Self> {
        match detect_framing(buf, &[(Self::MAGIC_DATA, Self::MIN_LEN), (Self::MAGIC_ACK, Self::MIN_LEN)]) {
            Framing::PassThrough => DecodeResult::PassThrough(buf.clone()),
            Framing::NeedMoreBytes => DecodeResult::NeedMoreBytes,
            Framing::Known(magic) => {
                let bit = buf[MAGIC_LEN] != 0;
                if magic == Self::MAGIC_DATA {
                    DecodeResult::Decoded(StopAndWaitFrame::Data {
                        bit,
                        payload: buf.slice(Self::MIN_LEN..),
                    })
                }
                else {
                    DecodeResult::Decoded(StopAndWaitFrame::Ack { bit })
                }
            }
        }
    }
}
