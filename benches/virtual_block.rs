use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use renderer_backend::renderer::alloc::{VirtualAllocation, VirtualBlock};

const CAPACITY: u64 = 64 << 20;

fn churn(block: &mut VirtualBlock, rng: &mut StdRng, live: &mut Vec<VirtualAllocation>) {
    for _ in 0..1000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(16..64 * 1024);
            let alignment = 1 << rng.gen_range(2..9);
            if let Ok(allocation) = block.allocate(size, alignment) {
                live.push(allocation);
            }
        } else {
            let ix = rng.gen_range(0..live.len());
            block.free(live.swap_remove(ix));
        }
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("virtual block allocate/free churn", |b| {
        b.iter_batched(
            || (VirtualBlock::new(CAPACITY), StdRng::seed_from_u64(0x5eed), vec![]),
            |(mut block, mut rng, mut live)| {
                churn(&mut block, &mut rng, &mut live);
                black_box(block.free_bytes());
            },
            BatchSize::SmallInput,
        )
    });

    // Fragmented steady state: half the capacity is held by small live ranges.
    c.bench_function("virtual block fragmented churn", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        let mut block = VirtualBlock::new(CAPACITY);
        let mut live = vec![];
        while block.free_bytes() > CAPACITY / 2 {
            match block.allocate(rng.gen_range(256..4096), 256) {
                Ok(allocation) => live.push(allocation),
                Err(_) => break,
            }
        }
        b.iter(|| churn(&mut block, &mut rng, &mut live));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
