use bytes::Bytes;
use civicvault_core::{content_hash, Chunker, Command, Reply};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark: WRITE command framing for common chunk sizes
fn bench_command_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_command");
    for size in [4 * 1024, 256 * 1024, 2 * 1024 * 1024] {
        let command = Command::Write {
            chunk_id: format!("{}_0", "ab".repeat(32)),
            data: Bytes::from(vec![7u8; size]),
        };
        let encoded = command.encode().unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &command, |b, command| {
            b.iter(|| black_box(command.encode().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| black_box(Command::decode(encoded.clone()).unwrap()))
        });
    }
    group.finish();

    c.bench_function("reply_data_decode_1mb", |b| {
        let encoded = Reply::Data(Bytes::from(vec![1u8; 1024 * 1024]))
            .encode()
            .unwrap();
        b.iter(|| black_box(Reply::decode(encoded.clone()).unwrap()))
    });
}

/// Benchmark: splitting a 64 MB payload into chunks
fn bench_chunker(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 64 * 1024 * 1024]);
    let chunker = Chunker::default();

    c.bench_function("split_64mb", |b| {
        b.iter(|| black_box(chunker.split(&payload)))
    });
}

/// Benchmark: SHA-256 content hashing
fn bench_content_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");
    for size in [1024, 1024 * 1024, 16 * 1024 * 1024] {
        let data = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(content_hash(data)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_command_codec, bench_chunker, bench_content_hash);
criterion_main!(benches);
