use bytes::Bytes;
use courier::protocol::{read_frame, write_frame, Frame, FrameKind, CHUNK_SIZE, HEADER_LEN};
use courier::reply;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn chunk_frame(size: usize) -> Frame {
    Frame::new(FrameKind::FileChunk)
        .with_sender("alice")
        .with_recipient("bob")
        .with_transfer_id("3f1c2a9e-5b7d-4e0a-9c41-8d2f6b0e7a13")
        .with_seq(17)
        .with_bin(Bytes::from(vec![0xA5u8; size]))
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_chunk");

    for size in [1024, 16 * 1024, CHUNK_SIZE].iter() {
        let frame = chunk_frame(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode().unwrap()));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_chunk");

    for size in [1024, 16 * 1024, CHUNK_SIZE].iter() {
        let encoded = chunk_frame(*size).encode().unwrap();
        let payload = encoded.slice(HEADER_LEN..);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(Frame::decode(FrameKind::FileChunk, payload.clone()).unwrap()));
        });
    }

    group.finish();
}

fn bench_stream_roundtrip(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let frames: Vec<Frame> = (0..64).map(|_| chunk_frame(CHUNK_SIZE)).collect();

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes((frames.len() * CHUNK_SIZE) as u64));
    group.bench_function("write_then_read_64_chunks", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut wire = Vec::with_capacity(frames.len() * (CHUNK_SIZE + 128));
                for frame in &frames {
                    write_frame(&mut wire, frame).await.unwrap();
                }
                let mut reader = wire.as_slice();
                let mut n = 0;
                while let Some(frame) = read_frame(&mut reader).await.unwrap() {
                    n += frame.bin.map(|b| b.len()).unwrap_or(0);
                }
                black_box(n)
            })
        });
    });
    group.finish();
}

fn bench_reply_tag(c: &mut Criterion) {
    let tagged = format!("[REPLY:123456]{}", "lorem ipsum ".repeat(20));
    c.bench_function("reply_strip", |b| {
        b.iter(|| black_box(reply::strip(black_box(&tagged))));
    });
    c.bench_function("reply_prepend", |b| {
        b.iter(|| black_box(reply::prepend(black_box("see you at noon"), Some(98765))));
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_stream_roundtrip,
    bench_reply_tag
);
criterion_main!(benches);
