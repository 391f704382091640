//! # 编解码契约与参考实现
//!
//! ## 意图（Why）
//! - 核心只要求“从字节中解出零个或多个消息，并报告消耗了多少前缀字节”，
//!   不强加任何线格式；
//! - 提供三个参考编解码器，既是契约的示例，也让测试与基准有可用的实现。
//!
//! ## 契约（What）
//! - `decode` 只消费完整帧；剩余不完整的字节由重组器保留到下一次调用；
//! - `consumed` 不得超过输入长度；
//! - 解码失败的策略由编解码器决定，重组器原样向上传递。

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 一次解码的结果：完整消息与消耗的前缀字节数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded<M> {
    pub messages: Vec<M>,
    pub consumed: usize,
}

impl<M> Decoded<M> {
    /// 未解出任何消息。
    pub fn nothing() -> Self {
        Self {
            messages: Vec::new(),
            consumed: 0,
        }
    }
}

/// 编解码失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// 可插拔的编解码器。
pub trait Codec: Send + Sync + 'static {
    /// 入站消息类型。
    type In: Clone + Send + 'static;
    /// 出站消息类型。
    type Out: Send + 'static;

    /// 从 `input` 前缀解出完整消息。
    fn decode(&self, input: &[u8]) -> Result<Decoded<Self::In>, CodecError>;

    /// 编码一个出站消息。
    fn encode(&self, message: Self::Out) -> Result<Bytes, CodecError>;

    /// 是否需要跨块重组；返回 `false` 时每个块独立交给 [`Codec::decode_whole`]。
    fn reassembles(&self) -> bool {
        true
    }

    /// 不重组时对单个完整块的处理。
    fn decode_whole(&self, chunk: Bytes) -> Result<Vec<Self::In>, CodecError> {
        Ok(self.decode(&chunk)?.messages)
    }
}

/// 进入重组器的入站块：原始字节，或已经结构化的消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundChunk<M> {
    Bytes(BytesMut),
    Message(M),
}

/// “无编解码器”：原样投递字节块，不做重组。
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type In = Bytes;
    type Out = Bytes;

    fn decode(&self, input: &[u8]) -> Result<Decoded<Bytes>, CodecError> {
        Ok(Decoded {
            messages: vec![Bytes::copy_from_slice(input)],
            consumed: input.len(),
        })
    }

    fn encode(&self, message: Bytes) -> Result<Bytes, CodecError> {
        Ok(message)
    }

    fn reassembles(&self) -> bool {
        false
    }

    fn decode_whole(&self, chunk: Bytes) -> Result<Vec<Bytes>, CodecError> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![chunk])
    }
}

/// 4 字节大端长度前缀帧。
#[derive(Clone, Copy, Debug)]
pub struct LengthFieldCodec {
    max_frame: usize,
}

impl LengthFieldCodec {
    pub const HEADER_LEN: usize = 4;
    pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for LengthFieldCodec {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_FRAME)
    }
}

impl Codec for LengthFieldCodec {
    type In = Bytes;
    type Out = Bytes;

    fn decode(&self, input: &[u8]) -> Result<Decoded<Bytes>, CodecError> {
        let mut decoded = Decoded::nothing();
        let mut cursor = 0;
        while input.len() - cursor >= Self::HEADER_LEN {
            let mut header = [0u8; Self::HEADER_LEN];
            header.copy_from_slice(&input[cursor..cursor + Self::HEADER_LEN]);
            let len = u32::from_be_bytes(header) as usize;
            if len > self.max_frame {
                return Err(CodecError::FrameTooLarge {
                    size: len,
                    limit: self.max_frame,
                });
            }
            let start = cursor + Self::HEADER_LEN;
            if input.len() - start < len {
                break;
            }
            decoded
                .messages
                .push(Bytes::copy_from_slice(&input[start..start + len]));
            cursor = start + len;
        }
        decoded.consumed = cursor;
        Ok(decoded)
    }

    fn encode(&self, message: Bytes) -> Result<Bytes, CodecError> {
        if message.len() > self.max_frame || message.len() > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                size: message.len(),
                limit: self.max_frame,
            });
        }
        let mut out = BytesMut::with_capacity(Self::HEADER_LEN + message.len());
        out.put_u32(message.len() as u32);
        out.put_slice(&message);
        Ok(out.freeze())
    }
}

/// 以 `\n` 分隔的 UTF-8 文本行，解码时去掉可选的 `\r`。
#[derive(Clone, Copy, Debug)]
pub struct LineCodec {
    max_line: usize,
}

impl LineCodec {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Codec for LineCodec {
    type In = String;
    type Out = String;

    fn decode(&self, input: &[u8]) -> Result<Decoded<String>, CodecError> {
        let mut decoded = Decoded::nothing();
        let mut cursor = 0;
        while let Some(offset) = input[cursor..].iter().position(|b| *b == b'\n') {
            let mut line = &input[cursor..cursor + offset];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > self.max_line {
                return Err(CodecError::FrameTooLarge {
                    size: line.len(),
                    limit: self.max_line,
                });
            }
            let text = std::str::from_utf8(line).map_err(|_| CodecError::InvalidUtf8)?;
            decoded.messages.push(text.to_owned());
            cursor += offset + 1;
        }
        // 没有分隔符的残余同样受行长上限约束，避免无界累积。
        if input.len() - cursor > self.max_line {
            return Err(CodecError::FrameTooLarge {
                size: input.len() - cursor,
                limit: self.max_line,
            });
        }
        decoded.consumed = cursor;
        Ok(decoded)
    }

    fn encode(&self, message: String) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::with_capacity(message.len() + 1);
        out.put_slice(message.as_bytes());
        out.put_u8(b'\n');
        Ok(out.freeze())
    }
}
