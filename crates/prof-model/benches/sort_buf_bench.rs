use criterion::{Criterion, black_box, criterion_group, criterion_main};
use prof_model::timepoints::{MetricTimepoint, SortBuf};

fn shuffled_times(n: u64, stride: u64) -> Vec<u64> {
    // Deterministic K-disordered stream: swap within stride-sized blocks.
    let mut v: Vec<u64> = (0..n).collect();
    for chunk in v.chunks_mut(stride as usize) {
        chunk.reverse();
    }
    v
}

fn bench_sort_buf(c: &mut Criterion) {
    for k in [15u64, 255, 1023] {
        c.bench_function(&format!("sort_buf_k{k}"), |b| {
            let times = shuffled_times(100_000, k + 1);
            b.iter(|| {
                let mut buf: SortBuf<MetricTimepoint> = SortBuf::new(k as usize + 2);
                let mut out = 0u64;
                for &t in &times {
                    let tp = MetricTimepoint { time: t, value: 1.0 };
                    if !buf.full() {
                        buf.push(tp);
                        continue;
                    }
                    let (evicted, over) = buf.replace(tp);
                    assert!(!over);
                    out = out.wrapping_add(evicted.time);
                }
                for tp in buf.sorted() {
                    out = out.wrapping_add(tp.time);
                }
                black_box(out)
            })
        });
    }
}

criterion_group!(benches, bench_sort_buf);
criterion_main!(benches);
