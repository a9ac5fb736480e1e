use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use uuid::Uuid;

use conflux_core::diff::{ChangeRecord, GraphDiff, VersionedDiff};
use conflux_core::graph::PipelineDoc;
use conflux_sync::presence::CursorPos;
use conflux_sync::protocol::{CursorPayload, WireMessage};

fn sample_diff(nodes: usize) -> GraphDiff {
    let mut diff = GraphDiff::new();
    for i in 0..nodes {
        diff.set_node(
            Uuid::new_v4(),
            json!({"kind": "transform", "step": i, "params": {"window": 7}}),
        );
    }
    diff
}

fn bench_cursor_encode(c: &mut Criterion) {
    let ws = Uuid::new_v4();
    let cursor = CursorPayload {
        user_id: Uuid::new_v4(),
        position: CursorPos::new(640.0, 360.0),
        timestamp: 42,
    };

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            let msg = WireMessage::cursor_move(black_box(ws), black_box(cursor));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_cursor_decode(c: &mut Criterion) {
    let msg = WireMessage::cursor_move(
        Uuid::new_v4(),
        CursorPayload {
            user_id: Uuid::new_v4(),
            position: CursorPos::new(640.0, 360.0),
            timestamp: 42,
        },
    );
    let encoded = msg.encode().unwrap();

    c.bench_function("cursor_decode", |b| {
        b.iter(|| {
            black_box(WireMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_update_encode(c: &mut Criterion) {
    let ws = Uuid::new_v4();
    let record = ChangeRecord::new(ws, Uuid::new_v4(), 10, sample_diff(4));

    c.bench_function("pipeline_update_encode_4_nodes", |b| {
        b.iter(|| {
            let msg = WireMessage::pipeline_update(black_box(&record)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_diff_merge(c: &mut Criterion) {
    let diffs: Vec<GraphDiff> = (0..100).map(|_| sample_diff(2)).collect();

    c.bench_function("merge_100_diffs", |b| {
        b.iter(|| {
            let mut doc = PipelineDoc::new();
            for diff in &diffs {
                doc.apply_diff(black_box(diff));
            }
            black_box(doc.node_count());
        })
    });
}

fn bench_state_update_roundtrip(c: &mut Criterion) {
    let ws = Uuid::new_v4();
    let vdiff = VersionedDiff {
        version: 7,
        origin_user_id: Uuid::new_v4(),
        diff: sample_diff(1),
    };

    c.bench_function("state_update_roundtrip", |b| {
        b.iter(|| {
            let msg = WireMessage::state_update(ws, &vdiff).unwrap();
            let encoded = msg.encode().unwrap();
            let decoded = WireMessage::decode(&encoded).unwrap();
            black_box(decoded.versioned_diff().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_cursor_encode,
    bench_cursor_decode,
    bench_update_encode,
    bench_diff_merge,
    bench_state_update_roundtrip,
);
criterion_main!(benches);
