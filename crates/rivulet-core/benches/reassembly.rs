use std::{hint::black_box, sync::Arc};

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rivulet_core::{Codec, InboundChunk, LengthFieldCodec, Reassembler, ReassemblyLimits};

fn wire(frames: usize, frame_len: usize) -> Vec<u8> {
    let codec = LengthFieldCodec::default();
    let mut out = Vec::with_capacity(frames * (frame_len + 4));
    for i in 0..frames {
        let payload = Bytes::from(vec![(i % 251) as u8; frame_len]);
        out.extend_from_slice(&codec.encode(payload).expect("编码失败"));
    }
    out
}

fn bench_reassembly(c: &mut Criterion) {
    let data = wire(1_024, 200);
    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for chunk in [7usize, 512, 16 * 1024] {
        group.bench_function(format!("length_field/chunk_{chunk}"), |b| {
            b.iter(|| {
                let mut r = Reassembler::new(
                    Arc::new(LengthFieldCodec::default()),
                    ReassemblyLimits::default(),
                );
                let mut decoded = 0usize;
                for piece in data.chunks(chunk) {
                    decoded += r
                        .feed(InboundChunk::Bytes(BytesMut::from(piece)))
                        .expect("重组失败")
                        .len();
                }
                black_box(decoded)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reassembly);
criterion_main!(benches);
