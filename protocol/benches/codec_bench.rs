// Payload codec and chain link benchmarks for AuditChain.
//
// Covers batch encoding on both sides of the compression threshold,
// decoding, and building plus serializing a chain link.

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use auditchain_protocol::batch::{Batch, LogEntry};
use auditchain_protocol::chain::ChainHead;
use auditchain_protocol::codec::{decode, encode};
use auditchain_protocol::config::DEFAULT_MAX_PAYLOAD_BYTES;
use auditchain_protocol::transaction::ChainLinkBuilder;

fn batch_of(n: usize) -> Batch {
    let entries = (0..n)
        .map(|i| {
            LogEntry::from_value(json!({
                "action": "tool_call",
                "tool": "web_search",
                "tokens_in": i,
                "tokens_out": i * 3,
            }))
            .expect("object")
        })
        .collect();
    Batch::new("bench-agent", Utc::now(), entries)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/encode");
    // 10 entries stay plain; 60 cross the 4 KiB threshold and compress.
    for n in [10usize, 60] {
        let batch = batch_of(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &batch, |b, batch| {
            b.iter(|| encode(batch, DEFAULT_MAX_PAYLOAD_BYTES).expect("fits"));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec/decode");
    for n in [10usize, 60] {
        let payload = encode(&batch_of(n), DEFAULT_MAX_PAYLOAD_BYTES).expect("fits");
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &payload.bytes, |b, bytes| {
            b.iter(|| decode(bytes));
        });
    }
    group.finish();
}

fn bench_build_link(c: &mut Criterion) {
    let payload = encode(&batch_of(10), DEFAULT_MAX_PAYLOAD_BYTES)
        .expect("fits")
        .bytes;
    let head = ChainHead::new("ab".repeat(32), 1, 1_000_000);

    c.bench_function("link/build_and_serialize", |b| {
        b.iter(|| {
            let link = ChainLinkBuilder::new(head.clone())
                .payload(payload.clone())
                .change_script(vec![0x76, 0xa9, 0x14])
                .build()
                .expect("funded");
            link.transaction.txid().expect("valid txid")
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_build_link);
criterion_main!(benches);
