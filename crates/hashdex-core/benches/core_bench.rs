//! Criterion benchmarks for hashdex-core.
//!
//! ## Benchmark groups
//!
//! 1. **content_hash**: digest normalization and hash-id enumeration.
//! 2. **derived_update**: diff-based index updates with small deltas.
//! 3. **scan**: cold and warm scanner passes over an in-memory file set.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/hashdex-core/Cargo.toml
//! # Run only the scan group:
//! cargo bench --manifest-path crates/hashdex-core/Cargo.toml -- scan
//! ```

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use hashdex_core::index::derived::DerivedDataIndex;
use hashdex_core::index::set::IndexSet;
use hashdex_core::indexer::local::LocalIndexer;
use hashdex_core::indexer::scanner::UnindexedFileScanner;
use hashdex_core::models::{InputData, Stamp};
use hashdex_core::store::hash_store::ContentHashStore;
use hashdex_core::store::storage::{MemoryIndexStorage, SqliteIndexStorage};
use hashdex_core::{builtin_kinds, ContentHash, IndexerConfig, MemoryFileSource, ProgressScope};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RUST_SOURCE: &str = "use std::collections::HashMap;\n\
pub struct Registry { entries: HashMap<String, u32> }\n\
impl Registry {\n    pub fn insert(&mut self, name: &str) -> u32 { 0 }\n}\n\
fn helper_function(value: u32) -> u32 { value + 1 }\n";

/// `n` files, a quarter of them sharing content.
fn populate_source(n: usize) -> MemoryFileSource {
    let source = MemoryFileSource::new();
    for i in 0..n {
        let body = if i % 4 == 0 {
            RUST_SOURCE.to_string()
        } else {
            format!("{RUST_SOURCE}\nfn generated_{i}() {{}}\n")
        };
        source.add(format!("src/module_{i}.rs"), body.as_bytes());
    }
    source
}

fn key_set(prefix: &str, n: usize) -> InputData {
    (0..n)
        .map(|i| (format!("{prefix}_{i}"), (i as u32).to_le_bytes().to_vec()))
        .collect()
}

fn bench_config() -> IndexerConfig {
    IndexerConfig {
        workers: 4,
        ..IndexerConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Benchmark: Content hashing
// ---------------------------------------------------------------------------

fn bench_content_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");

    for lines in [10usize, 1000] {
        let unix = "fn body() { let x = 1; }\n".repeat(lines);
        let dos = unix.replace('\n', "\r\n");
        group.bench_with_input(BenchmarkId::new("of/lf", lines), &unix, |b, text| {
            b.iter(|| ContentHash::of(black_box(text.as_bytes())));
        });
        group.bench_with_input(BenchmarkId::new("of/crlf", lines), &dos, |b, text| {
            b.iter(|| ContentHash::of(black_box(text.as_bytes())));
        });
    }

    let store = ContentHashStore::open_in_memory().unwrap();
    let known = ContentHash::of(b"already stored");
    store.enumerate(&known).unwrap();
    group.bench_function("enumerate/existing", |b| {
        b.iter(|| store.enumerate(black_box(&known)).unwrap());
    });

    let mut counter = 0u64;
    group.bench_function("enumerate/fresh", |b| {
        b.iter(|| {
            counter += 1;
            store
                .enumerate(&ContentHash::of(&counter.to_le_bytes()))
                .unwrap()
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Diff-based updates
// ---------------------------------------------------------------------------

fn bench_derived_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("derived_update");

    let base = key_set("word", 500);
    let mut edited = base.clone();
    edited.remove("word_0");
    edited.insert("word_new".to_string(), Vec::new());

    let memory = DerivedDataIndex::new("words", 1, Box::new(MemoryIndexStorage::new()));
    memory.update(1, &base, Stamp::local(1, 1)).unwrap();
    let mut flip = false;
    group.bench_function("memory/500_keys_2_changed", |b| {
        b.iter(|| {
            flip = !flip;
            let data = if flip { &edited } else { &base };
            memory.update(1, black_box(data), Stamp::local(1, 1)).unwrap()
        });
    });

    let sqlite = DerivedDataIndex::new(
        "words",
        1,
        Box::new(SqliteIndexStorage::open_in_memory().unwrap()),
    );
    sqlite.update(1, &base, Stamp::local(1, 1)).unwrap();
    group.bench_function("sqlite/500_keys_2_changed", |b| {
        b.iter(|| {
            flip = !flip;
            let data = if flip { &edited } else { &base };
            sqlite.update(1, black_box(data), Stamp::local(1, 1)).unwrap()
        });
    });

    group.bench_function("sqlite/500_keys_unchanged", |b| {
        b.iter(|| sqlite.update(1, black_box(&base), Stamp::local(1, 1)).unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: Scanner passes
// ---------------------------------------------------------------------------

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let config = bench_config();
    let source = populate_source(500);

    group.bench_function("cold/500_files", |b| {
        b.iter_batched(
            || IndexSet::in_memory(builtin_kinds()).unwrap(),
            |indexes| {
                let out = UnindexedFileScanner::new(&source, &indexes, &config, None)
                    .scan(&ProgressScope::new())
                    .unwrap();
                black_box(out);
            },
            BatchSize::SmallInput,
        );
    });

    let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
    let hashes = ContentHashStore::open_in_memory().unwrap();
    let scope = ProgressScope::new();
    let first = UnindexedFileScanner::new(&source, &indexes, &config, None)
        .scan(&scope)
        .unwrap()
        .finished()
        .unwrap();
    LocalIndexer::new(&source, &indexes, &hashes, &config, None)
        .index_files(&first.files, &scope)
        .unwrap();

    group.bench_function("warm/500_files", |b| {
        b.iter(|| {
            let out = UnindexedFileScanner::new(&source, &indexes, &config, None)
                .scan(&ProgressScope::new())
                .unwrap();
            black_box(out);
        });
    });

    group.bench_function("local_index/500_files", |b| {
        b.iter_batched(
            || {
                let indexes = IndexSet::in_memory(builtin_kinds()).unwrap();
                let scan = UnindexedFileScanner::new(&source, &indexes, &config, None)
                    .scan(&ProgressScope::new())
                    .unwrap()
                    .finished()
                    .unwrap();
                (indexes, scan.files)
            },
            |(indexes, files)| {
                let hashes = ContentHashStore::open_in_memory().unwrap();
                let stats = LocalIndexer::new(&source, &indexes, &hashes, &config, None)
                    .index_files(&files, &ProgressScope::new())
                    .unwrap();
                black_box(stats);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(benches, bench_content_hash, bench_derived_update, bench_scan);
criterion_main!(benches);
