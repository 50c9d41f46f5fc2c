// SPDX-License-Identifier: MIT OR Apache-2.0
//! Benchmarks for wire parsing and canonical serialization.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mew_core::codec::{ParseOptions, parse_draft, to_canonical_string};
use serde_json::json;

fn chat_wire() -> String {
    json!({
        "protocol": "mew/v0.4",
        "kind": "chat",
        "to": ["bob"],
        "payload": {"text": "the quick brown fox"},
    })
    .to_string()
}

fn request_wire() -> String {
    json!({
        "protocol": "mew/v0.4",
        "kind": "mcp/request",
        "to": ["tool-server"],
        "correlation_id": [uuid::Uuid::new_v4()],
        "context": {"operation": "push", "topic": "planning"},
        "payload": {
            "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 2, "b": 3}},
        },
    })
    .to_string()
}

fn bench_parse(c: &mut Criterion) {
    let chat = chat_wire();
    let request = request_wire();
    c.bench_function("parse_draft_chat", |b| {
        b.iter(|| parse_draft(black_box(&chat), ParseOptions::default()).unwrap());
    });
    c.bench_function("parse_draft_request", |b| {
        b.iter(|| parse_draft(black_box(&request), ParseOptions::default()).unwrap());
    });
    c.bench_function("parse_draft_strict", |b| {
        b.iter(|| parse_draft(black_box(&request), ParseOptions { strict: true }).unwrap());
    });
}

fn bench_canonical(c: &mut Criterion) {
    let envelope = parse_draft(&request_wire(), ParseOptions::default())
        .unwrap()
        .seal("bench");
    c.bench_function("to_canonical_string", |b| {
        b.iter(|| to_canonical_string(black_box(&envelope)).unwrap());
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    let envelope = parse_draft(&request_wire(), ParseOptions::default())
        .unwrap()
        .seal("bench");
    let line = to_canonical_string(&envelope).unwrap();
    c.bench_function("reparse_canonical_envelope", |b| {
        b.iter(|| mew_core::codec::parse_envelope(black_box(&line)).unwrap());
    });
}

criterion_group!(benches, bench_parse, bench_canonical, bench_roundtrip);
criterion_main!(benches);
