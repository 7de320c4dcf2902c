use std::sync::Arc;

use sharder::*;
use sharder::store::BlockStore;
use criterion::Criterion;

fn chain(n: i64) -> Vec<block::Block> {
    let miner = account::Keypair::gen();
    let mut prev = block::Block::genesis();
    let mut out = Vec::new();
    for _ in 0..n {
        let b = block::Builder::new(&prev).finalize(&miner);
        prev = b.clone();
        out.push(b);
    }
    out
}

pub fn blocks(crit: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let blocks = chain(100);

    let mem = store::mem::MemBlockStore::default();
    crit.bench_function("mem store write 100", |b| b.to_async(&rt).iter(|| async {
        for blk in &blocks {
            assert!(mem.write(blk).await.is_ok());
        }
    }));

    let dir = tempfile::tempdir().unwrap();
    let fs = store::fs::FsBlockStore::new(dir.path());
    crit.bench_function("fs store write 100", |b| b.to_async(&rt).iter(|| async {
        for blk in &blocks {
            assert!(fs.write(blk).await.is_ok());
        }
    }));
    crit.bench_function("fs store read 100", |b| b.to_async(&rt).iter(|| async {
        for blk in &blocks {
            assert!(fs.read(&blk.hash, blk.round).await.is_ok());
        }
    }));
}

pub fn cache(crit: &mut Criterion) {
    let blocks: Vec<Arc<block::Block>> = chain(1000).into_iter().map(Arc::new).collect();
    let c = cache::Cache::new(256);
    crit.bench_function("cache add 1k", |b| b.iter(|| {
        for blk in &blocks {
            c.add(blk.clone());
        }
    }));
    crit.bench_function("cache lookup 1k", |b| b.iter(|| {
        for blk in &blocks {
            let _ = c.block(&blk.hash);
        }
    }));
}
