use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::codec::{detect_framing, DecodeResult, FrameCodec, Framing, MAGIC_LEN};
use crate::seq::SeqNum;

/// Control bits of a [HandshakeSegment]. They can be combined, e.g. `SYN | ACK`.
pub mod ctl {
    pub const FIN: u8 = 1 << 0;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const PSH: u8 = 1 << 3;
    pub const ACK: u8 = 1 << 4;
}

/// ```ascii
///  0: magic number (u32 BE)
///  4: seq (u32 BE)
///  8: ack (u32 BE)
/// 12: ctl (u8)
/// 13: payload (rest of the message)
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeSegment {
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub ctl: u8,
    pub payload: Bytes,
}

impl Debug for HandshakeSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [(ctl::SYN, "SYN"), (ctl::FIN, "FIN"), (ctl::RST, "RST"), (ctl::PSH, "PSH"), (ctl::ACK, "ACK")];
        let flags = names.iter()
            .filter(|(bit, _)| self.ctl & bit != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "<{}> seq={} ack={} len={}", flags, self.seq, self.ack, self.payload.len())
    }
}

impl HandshakeSegment {
    pub const MAGIC: u32 = 0xDB1E_5E60;
    pub const MIN_LEN: usize = MAGIC_LEN + 2 * size_of::<u32>() + size_of::<u8>();

    pub fn new(seq: SeqNum, ack: SeqNum, ctl: u8) -> HandshakeSegment {
        HandshakeSegment {
            seq,
            ack,
            ctl,
            payload: Bytes::new(),
        }
    }

    pub fn syn(seq: SeqNum) -> HandshakeSegment {
        Self::new(seq, SeqNum::ZERO, ctl::SYN)
    }

    pub fn syn_ack(seq: SeqNum, ack: SeqNum) -> HandshakeSegment {
        Self::new(seq, ack, ctl::SYN | ctl::ACK)
    }

    pub fn ack(seq: SeqNum, ack: SeqNum) -> HandshakeSegment {
        Self::new(seq, ack, ctl::ACK)
    }

    pub fn fin_ack(seq: SeqNum, ack: SeqNum) -> HandshakeSegment {
        Self::new(seq, ack, ctl::FIN | ctl::ACK)
    }

    pub fn rst(seq: SeqNum) -> HandshakeSegment {
        Self::new(seq, SeqNum::ZERO, ctl::RST)
    }

    pub fn is_syn(&self) -> bool {
        self.ctl & ctl::SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.ctl & ctl::ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.ctl & ctl::FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.ctl & ctl::RST != 0
    }
}

impl FrameCodec for HandshakeSegment {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(Self::MAGIC);
        buf.put_u32(self.seq.to_raw());
        buf.put_u32(self.ack.to_raw());
        buf.put_u8(self.ctl);
        buf.put_slice(&self.payload);
    }

    fn deser(buf: &Bytes) -> DecodeResult<Self> {
        match detect_framing(buf, &[(Self::MAGIC, Self::MIN_LEN)]) {
            Framing::PassThrough => DecodeResult::PassThrough(buf.clone()),
            Framing::NeedMoreBytes => DecodeResult::NeedMoreBytes,
            Framing::Known(_) => {
                let mut parse_buf = &buf[MAGIC_LEN..];
                let seq = parse_buf.get_u32();
                let ack = parse_buf.get_u32();
                let ctl = parse_buf.get_u8();
                DecodeResult::Decoded(HandshakeSegment {
                    seq: SeqNum::from_raw(seq),
                    ack: SeqNum::from_raw(ack),
                    ctl,
                    payload: buf.slice(Self::MIN_LEN..),
                })
            }
        }
    }
}
