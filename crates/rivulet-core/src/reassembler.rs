//! # 入站字节重组
//!
//! ## 意图（Why）
//! - 流式与数据报传输交付的字节块边界与消息边界无关，需要把任意切分的块还原成
//!   可解码单元，并在调用之间保留未解码的残余；
//! - 残余缓冲必须有界，否则恶意或异常的对端可以让通道无限占用内存。
//!
//! ## 逻辑（How）
//! 1. 已结构化的消息或不需要重组的编解码器：原样交付；
//! 2. 无残余：直接在新块上解码，未读完的部分整体成为新残余；
//! 3. 有残余：若 `已有字节 + 新字节 <= max_capacity` 则原地追加，否则分配恰好容纳两者的
//!    新缓冲，依次拷贝残余与新块；
//! 4. 在（可能刚扩容的）残余上解码；
//! 5. 丢弃已读字节，若已全部读完则清空残余。
//!
//! ## 契约（What）
//! - 严格跳过编解码器报告的 `consumed` 字节，不会重复交付；
//! - 解码错误原样上抛，未读字节保留；
//! - 残余总量超过 `max_pending` 时丢弃残余并返回 [`TransportError::ReassemblyOverflow`]；
//!   经 [`Reassembler::feed_into`] 调用时，同一块里溢出之前已解出的消息仍会交付。
//!
//! ## 注意事项（Trade-offs）
//! - 重组器只在单个通道的读路径上使用，无需任何同步；
//! - `BytesMut` 可以自动扩容，这里仍显式维护 `max_capacity`，使“原地追加/重新分配”的
//!   决策可观察、可测试。

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::{
    codec::{Codec, CodecError, InboundChunk},
    error::TransportError,
};

/// 重组缓冲的容量策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// 新残余的最小名义容量。
    pub remainder_capacity: usize,
    /// 未解码字节的硬上限。
    pub max_pending: usize,
}

impl ReassemblyLimits {
    pub const DEFAULT_REMAINDER_CAPACITY: usize = 64 * 1024;
    pub const DEFAULT_MAX_PENDING: usize = 16 * 1024 * 1024;
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            remainder_capacity: Self::DEFAULT_REMAINDER_CAPACITY,
            max_pending: Self::DEFAULT_MAX_PENDING,
        }
    }
}

/// 重组过程的累计计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub chunks: u64,
    pub in_place_appends: u64,
    pub reallocations: u64,
}

#[derive(Debug)]
struct Remainder {
    buf: BytesMut,
    max_capacity: usize,
}

/// 单通道的重组状态机。
pub struct Reassembler<C: Codec> {
    codec: Arc<C>,
    limits: ReassemblyLimits,
    remainder: Option<Remainder>,
    stats: ReassemblyStats,
}

impl<C: Codec> Reassembler<C> {
    pub fn new(codec: Arc<C>, limits: ReassemblyLimits) -> Self {
        Self {
            codec,
            limits,
            remainder: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// 喂入一个入站块，返回本次得到的完整消息。
    ///
    /// 失败时同一块里已解出的消息随错误一并丢弃；需要保留它们时使用 [`Reassembler::feed_into`]。
    pub fn feed(&mut self, chunk: InboundChunk<C::In>) -> Result<Vec<C::In>, TransportError> {
        let mut messages = Vec::new();
        self.feed_into(chunk, &mut messages)?;
        Ok(messages)
    }

    /// 喂入一个入站块，把解出的消息追加到 `out`。
    ///
    /// 无残余时新块先解码、再检查剩余字节：即便随后报告溢出，`out` 里也已经是
    /// 溢出之前的完整消息。有残余时在扩容前检查上限，溢出直接丢弃残余。
    pub fn feed_into(
        &mut self,
        chunk: InboundChunk<C::In>,
        out: &mut Vec<C::In>,
    ) -> Result<(), TransportError> {
        let mut chunk = match chunk {
            InboundChunk::Message(message) => {
                out.push(message);
                return Ok(());
            }
            InboundChunk::Bytes(bytes) => bytes,
        };
        self.stats.chunks += 1;
        if !self.codec.reassembles() {
            out.extend(self.codec.decode_whole(chunk.freeze())?);
            return Ok(());
        }

        let Some(mut remainder) = self.remainder.take() else {
            out.extend(self.decode_from(&mut chunk)?);
            if !chunk.is_empty() {
                self.check_pending(chunk.len())?;
                let max_capacity = self.limits.remainder_capacity.max(chunk.len());
                trace!(pending = chunk.len(), "retaining unread chunk as remainder");
                self.remainder = Some(Remainder {
                    buf: chunk,
                    max_capacity,
                });
            }
            return Ok(());
        };

        let combined = remainder.buf.len() + chunk.len();
        self.check_pending(combined)?;
        if combined <= remainder.max_capacity {
            remainder.buf.extend_from_slice(&chunk);
            self.stats.in_place_appends += 1;
        } else {
            let mut grown = BytesMut::with_capacity(combined);
            grown.extend_from_slice(&remainder.buf);
            grown.extend_from_slice(&chunk);
            trace!(from = remainder.buf.len(), to = combined, "reallocating remainder");
            remainder = Remainder {
                buf: grown,
                max_capacity: self.limits.remainder_capacity.max(combined),
            };
            self.stats.reallocations += 1;
        }
        drop(chunk);

        let result = self.decode_from(&mut remainder.buf);
        if !remainder.buf.is_empty() {
            self.remainder = Some(remainder);
        }
        out.extend(result?);
        Ok(())
    }

    /// 当前残余字节数。
    pub fn pending(&self) -> usize {
        self.remainder.as_ref().map_or(0, |r| r.buf.len())
    }

    /// 当前残余的名义容量；无残余时为 `None`。
    pub fn remainder_capacity(&self) -> Option<usize> {
        self.remainder.as_ref().map(|r| r.max_capacity)
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// 丢弃残余，通道关闭时调用。
    pub fn reset(&mut self) {
        self.remainder = None;
    }

    fn check_pending(&mut self, pending: usize) -> Result<(), TransportError> {
        if pending > self.limits.max_pending {
            self.remainder = None;
            return Err(TransportError::ReassemblyOverflow {
                pending,
                limit: self.limits.max_pending,
            });
        }
        Ok(())
    }

    fn decode_from(&self, buf: &mut BytesMut) -> Result<Vec<C::In>, TransportError> {
        let decoded = self.codec.decode(buf)?;
        if decoded.consumed > buf.len() {
            return Err(CodecError::Malformed(format!(
                "codec consumed {} of {} bytes",
                decoded.consumed,
                buf.len()
            ))
            .into());
        }
        buf.advance(decoded.consumed);
        Ok(decoded.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LengthFieldCodec, LineCodec, RawCodec};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn chunk<M>(data: &[u8]) -> InboundChunk<M> {
        InboundChunk::Bytes(BytesMut::from(data))
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn fragmented_length_frame_decodes_once_complete() {
        let payload: Vec<u8> = (0..128u8).collect();
        let wire = framed(&payload);
        assert_eq!(wire.len(), 132);
        let mut r = Reassembler::new(Arc::new(LengthFieldCodec::default()), ReassemblyLimits::default());

        assert!(r.feed(chunk(&wire[..3])).unwrap().is_empty());
        assert!(r.feed(chunk(&wire[3..63])).unwrap().is_empty());
        let out = r.feed(chunk(&wire[63..])).unwrap();
        assert_eq!(out, vec![Bytes::from(payload)], "三段拼接后应得到唯一的 128 字节消息");
        assert_eq!(r.pending(), 0, "完全消费后不得保留残余");
    }

    #[test]
    fn overflowing_capacity_reallocates_and_preserves_order() {
        let payload: Vec<u8> = (0..146u32).map(|i| (i % 251) as u8).collect();
        let wire = framed(&payload);
        let limits = ReassemblyLimits {
            remainder_capacity: 110,
            max_pending: 1024,
        };
        let mut r = Reassembler::new(Arc::new(LengthFieldCodec::default()), limits);

        assert!(r.feed(chunk(&wire[..100])).unwrap().is_empty());
        assert_eq!(r.pending(), 100);
        assert_eq!(r.remainder_capacity(), Some(110));

        let out = r.feed(chunk(&wire[100..])).unwrap();
        let stats = r.stats();
        assert_eq!(stats.reallocations, 1, "100 + 50 超过 110 必须重新分配");
        assert_eq!(stats.in_place_appends, 0);
        assert_eq!(out, vec![Bytes::from(payload)]);
    }

    #[test]
    fn small_chunks_append_in_place() {
        let codec = Arc::new(LineCodec::default());
        let mut r = Reassembler::new(codec, ReassemblyLimits::default());
        assert!(r.feed(chunk(b"he")).unwrap().is_empty());
        assert!(r.feed(chunk(b"ll")).unwrap().is_empty());
        assert_eq!(r.feed(chunk(b"o\nwor")).unwrap(), vec!["hello".to_string()]);
        assert_eq!(r.pending(), 3);
        assert_eq!(r.stats().in_place_appends, 2);
        assert_eq!(r.stats().reallocations, 0);
    }

    #[test]
    fn exceeding_max_pending_drops_remainder() {
        let limits = ReassemblyLimits {
            remainder_capacity: 8,
            max_pending: 16,
        };
        let mut r = Reassembler::new(Arc::new(LengthFieldCodec::default()), limits);
        assert!(r.feed(chunk(&[0, 0, 0, 100, 1, 2, 3, 4])).unwrap().is_empty());
        let err = r.feed(chunk(&[9; 12])).unwrap_err();
        assert!(matches!(
            err,
            TransportError::ReassemblyOverflow { pending: 20, limit: 16 }
        ));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn overflow_keeps_messages_decoded_from_the_same_chunk() {
        let limits = ReassemblyLimits {
            remainder_capacity: 8,
            max_pending: 16,
        };
        let mut r = Reassembler::new(Arc::new(LengthFieldCodec::default()), limits);
        let mut wire = framed(b"ok");
        wire.extend_from_slice(&[0, 0, 0, 100]);
        wire.extend_from_slice(&[7; 16]);

        let mut out = Vec::new();
        let err = r.feed_into(chunk(&wire), &mut out).unwrap_err();
        assert_eq!(out, vec![Bytes::from_static(b"ok")], "溢出之前的完整消息不能丢");
        assert!(matches!(
            err,
            TransportError::ReassemblyOverflow { pending: 20, limit: 16 }
        ));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn structured_messages_and_raw_bytes_bypass_reassembly() {
        let mut r = Reassembler::new(Arc::new(RawCodec), ReassemblyLimits::default());
        let msg = Bytes::from_static(b"already decoded");
        assert_eq!(r.feed(InboundChunk::Message(msg.clone())).unwrap(), vec![msg]);
        assert_eq!(r.feed(chunk(b"abc")).unwrap(), vec![Bytes::from_static(b"abc")]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn decode_errors_pass_through_unchanged() {
        let mut r = Reassembler::new(Arc::new(LengthFieldCodec::new(4)), ReassemblyLimits::default());
        let err = r.feed(chunk(&[0, 0, 0, 5, 0])).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Codec(CodecError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_fragmentation_matches_whole_decode(
            messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..16),
            cuts in proptest::collection::vec(1usize..32, 1..64),
        ) {
            let codec = Arc::new(LengthFieldCodec::default());
            let wire: Vec<u8> = messages.iter().flat_map(|m| framed(m)).collect();
            let expected = codec.decode(&wire).unwrap().messages;

            let limits = ReassemblyLimits { remainder_capacity: 16, max_pending: 1 << 20 };
            let mut r = Reassembler::new(Arc::clone(&codec), limits);
            let mut produced = Vec::new();
            let mut offset = 0;
            let mut cut = cuts.iter().cycle();
            while offset < wire.len() {
                let step = (*cut.next().unwrap()).min(wire.len() - offset);
                produced.extend(r.feed(chunk(&wire[offset..offset + step])).unwrap());
                offset += step;
            }
            prop_assert_eq!(produced, expected);
            prop_assert_eq!(r.pending(), 0);
        }
    }
}
