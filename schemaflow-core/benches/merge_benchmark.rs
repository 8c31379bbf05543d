use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use schemaflow_core::{parse_patches, MergeableState, PatchedDocument, WorkspaceId, YrsState};
use serde_json::json;
use std::hint::black_box;
use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};

fn make_update(doc: &Doc, insert: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, insert);
    }
    doc.transact().encode_diff_v1(&before)
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Operations");
    group.throughput(Throughput::Elements(1));

    let source = Doc::new();
    let update = make_update(&source, "users(id, email)");

    group.bench_function("merge_duplicate_update", |b| {
        // Same update every iteration: exercises the idempotent path
        let mut state = YrsState::init();
        b.iter(|| {
            state.merge(black_box(&update)).unwrap();
        })
    });

    group.bench_function("encode_full_state_100_edits", |b| {
        let source = Doc::new();
        let mut state = YrsState::init();
        for i in 0..100 {
            state.merge(&make_update(&source, &format!("t{i};"))).unwrap();
        }
        b.iter(|| black_box(state.encode()))
    });

    group.finish();
}

fn bench_patch_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Patch Operations");
    group.throughput(Throughput::Elements(1));

    let doc = PatchedDocument::with_content(
        WorkspaceId::from("bench"),
        7,
        json!({"tables": (0..50).map(|i| format!("t{i}")).collect::<Vec<_>>()}),
    );
    let patches = parse_patches(r#"[{"op":"add","path":"/tables/-","value":"orders"}]"#).unwrap();

    group.bench_function("apply_patch_matching_version", |b| {
        b.iter(|| black_box(doc.apply(black_box(&patches), 7).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_patch_apply);
criterion_main!(benches);
