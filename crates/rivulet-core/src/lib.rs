#![doc = r#"
# rivulet-core

## 定位（Why）
- 为流式套接字、数据报套接字与多路复用套接字提供统一的通道模型（读、写、关闭）；
- 以单值 [`Promise`] 与多值 [`Broadcaster`] 暴露异步完成，而不是阻塞调用或裸回调。

## 组成（How）
- [`reassembler`]：把任意切分的字节块还原为可解码单元，跨调用保留残余缓冲；
- [`dispatcher`]：抽象“任务在哪里运行”，提供同步内联与工作线程池两种实现；
- [`channel`]：统一的每连接对象，持有编解码器、两个调度器、三态关闭标志与监听器列表；
- [`lifecycle`]：适配器 `start`/`shutdown` 的不可重入守卫；
- [`config`]：只读的套接字与 TLS 配置值；
- [`observability`]：`tracing` 订阅器初始化。

## 约束（What）
- 核心不实现事件循环：原生驱动运行在调用方提供的 Tokio 运行时上（见 [`env::Environment`]）；
- 跨异步边界的失败只通过 Promise 拒绝或序列错误终止信号传播。
"#]

pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod promise;
pub mod reassembler;
pub mod sequence;
pub mod test_stubs;

use std::sync::atomic::{AtomicU64, Ordering};

pub use channel::{
    ChannelCallback, ChannelCallbacks, ChannelId, ChannelSettings, ChannelSink, ChannelState,
    NativeConnection, NetChannel,
};
pub use codec::{Codec, CodecError, Decoded, InboundChunk, LengthFieldCodec, LineCodec, RawCodec};
pub use config::{ChannelInitializer, ServerSocketOptions, SslOptions};
pub use dispatcher::{
    DispatchError, Dispatcher, SharedDispatcher, SyncDispatcher, Task, WorkerPoolDispatcher,
};
pub use env::Environment;
pub use error::{OperationKind, TransportError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use promise::{CompletionGuard, Promise};
pub use reassembler::{Reassembler, ReassemblyLimits, ReassemblyStats};
pub use sequence::{Broadcaster, SequenceStream};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内单调递增的标识，用于通道、Promise 与序列的调度键。
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
