//! Benchmarks for the handle codec, the lock registry and journal replays

use cephfs_provisioner::backends::InMemoryCluster;
use cephfs_provisioner::journal::{Journal, JournalConfig, ObjectIdentifier, ReservationAttrs};
use cephfs_provisioner::locks::LockRegistry;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use uuid::Uuid;

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("identifier_codec");
    group.throughput(Throughput::Elements(1));

    let id = ObjectIdentifier::new("rook-ceph-cluster-eu-west-1", 7, Uuid::new_v4()).unwrap();
    let handle = id.encode();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&id).encode());
    });

    group.bench_function("decode", |b| {
        b.iter(|| ObjectIdentifier::decode(black_box(&handle)).unwrap());
    });

    group.bench_function("decode_rejects_truncated", |b| {
        let truncated = &handle[..handle.len() - 1];
        b.iter(|| ObjectIdentifier::decode(black_box(truncated)).is_err());
    });

    group.finish();
}

fn bench_lock_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_registry");
    group.throughput(Throughput::Elements(1));

    let registry = LockRegistry::new();
    for i in 0..1000 {
        registry.try_acquire(&format!("pvc-held-{:04}", i));
    }

    group.bench_function("acquire_release", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("pvc-{}", counter % 1000);
            assert!(registry.try_acquire(black_box(&key)));
            registry.release(&key);
        });
    });

    group.bench_function("contended_acquire", |b| {
        b.iter(|| registry.try_acquire(black_box("pvc-held-0042")));
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    group.throughput(Throughput::Elements(100));
    group.bench_function("concurrent_100_guards", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let registry = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let key = format!("pvc-task-{}", i);
                        let _guard = registry.lock(&key);
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_reservation_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservation_journal");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let cluster = InMemoryCluster::new();
    cluster.add_pool("ceph", "cephfs.meta", 1);
    let journal = Journal::new(JournalConfig::volumes("default", "csi-vol-", "csi"), cluster);
    let pool = journal.pool_ref("ceph", "cephfs.meta");
    let attrs = ReservationAttrs {
        request_name: "pvc-bench".into(),
        fs_name: "cephfs".into(),
        subvolume_group: "csi".into(),
        size_bytes: 1 << 30,
        ..Default::default()
    };
    rt.block_on(journal.reserve(&pool, attrs.clone())).unwrap();

    group.bench_function("replayed_reserve", |b| {
        b.iter(|| {
            rt.block_on(journal.reserve(black_box(&pool), attrs.clone()))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_lock_registry,
    bench_reservation_replay,
);
criterion_main!(benches);
