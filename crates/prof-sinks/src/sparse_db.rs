//! The sparse value database: the numeric half of the output database.
//!
//! `profile.db` stores each thread's nonzero (context, metric-variant)
//! values as sparse triples, plus a per-context index so readers can find
//! all values for one context without scanning every profile. Threads are
//! processed as they finalize once the contexts+threads wavefront has
//! passed; the final write drains cooperatively through the workshare.

use bytes::BufMut;
use prof_collective::SharedAccumulator;
use prof_model::{DataClass, ExtensionClass, MetricScope, PerThreadTemporary};
use prof_pipeline::{ProfileSink, SinkHandle, Workshare, WorkshareResult};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

const MAGIC: &[u8; 8] = b"PROFSPRS";
const VERSION: u32 = 1;

struct ProfileRec {
    thread_id: u32,
    /// (context id, metric variant id, value), sorted.
    values: Vec<(u32, u32, f64)>,
}

#[derive(Default)]
struct Inner {
    wavefront_passed: bool,
    prebuffer: Vec<Arc<PerThreadTemporary>>,
    profiles: Vec<ProfileRec>,
    ctx_values: HashMap<u32, u64>,
}

/// Sink writing `profile.db` into the database directory.
pub struct SparseDB {
    dir: PathBuf,
    handle: Option<SinkHandle>,
    inner: Mutex<Inner>,
    workshare: Workshare<Arc<PerThreadTemporary>>,
    /// Cross-rank profile index allocation; local atomic when standalone.
    profile_index: Option<Arc<SharedAccumulator>>,
}

impl SparseDB {
    pub fn new(dir: PathBuf) -> Self {
        SparseDB {
            dir,
            handle: None,
            inner: Mutex::new(Inner::default()),
            workshare: Workshare::new(),
            profile_index: None,
        }
    }

    /// Coordinate profile indices across ranks through the accumulator.
    /// The caller must have `initialize`d it on every rank.
    pub fn with_profile_index(mut self, acc: Arc<SharedAccumulator>) -> Self {
        self.profile_index = Some(acc);
        self
    }

    fn process(&self, tt: &Arc<PerThreadTemporary>) {
        let h = self.handle.as_ref().expect("sink not bound");
        let thread_id = h.thread_id(tt.thread());
        let mut values = Vec::new();
        {
            let data = tt.finalized_data();
            for (ctx, metrics) in data.iter() {
                let ctx_id = h.context_id(ctx.inner());
                for (m, raws) in metrics {
                    let id = h.metric_id(m.inner());
                    let scope = m
                        .scopes()
                        .members()
                        .find(|s| *s == MetricScope::Point)
                        .or_else(|| m.scopes().members().next());
                    let Some(scope) = scope else { continue };
                    for (p, raw) in raws.iter().enumerate() {
                        if raw.is_zero() {
                            continue;
                        }
                        let Some(vid) = id.get(p, scope) else { continue };
                        let value = raw.get(m.partials()[p].combinator);
                        values.push((ctx_id, vid, value));
                    }
                }
            }
        }
        values.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)).then(a.2.total_cmp(&b.2)));

        let mut inner = self.inner.lock().expect("sparsedb state poisoned");
        for &(ctx, _, _) in &values {
            *inner.ctx_values.entry(ctx).or_insert(0) += 1;
        }
        inner.profiles.push(ProfileRec { thread_id, values });
    }

    fn drain(&self) -> WorkshareResult {
        self.workshare.contribute(|tt| self.process(&tt))
    }
}

impl ProfileSink for SparseDB {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }

    fn accepts(&self) -> DataClass {
        DataClass::THREADS | DataClass::CONTEXTS | DataClass::METRICS
    }
    fn wavefronts(&self) -> DataClass {
        DataClass::CONTEXTS | DataClass::THREADS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }

    fn notify_wavefront(&self, delivered: DataClass) {
        if !delivered.has_contexts() || !delivered.has_threads() {
            return;
        }
        let staged = {
            let mut inner = self.inner.lock().expect("sparsedb state poisoned");
            inner.wavefront_passed = true;
            std::mem::take(&mut inner.prebuffer)
        };
        for tt in staged {
            self.workshare.push(tt);
        }
        self.drain();
    }

    fn notify_thread_final(&self, tt: &Arc<PerThreadTemporary>) {
        {
            let mut inner = self.inner.lock().expect("sparsedb state poisoned");
            if !inner.wavefront_passed {
                inner.prebuffer.push(tt.clone());
                return;
            }
        }
        self.workshare.push(tt.clone());
        self.drain();
    }

    fn help(&self) -> WorkshareResult {
        self.drain()
    }

    fn write(&self) -> std::io::Result<()> {
        // Anything still prebuffered (wavefront without providers) drains now.
        let staged = {
            let mut inner = self.inner.lock().expect("sparsedb state poisoned");
            inner.wavefront_passed = true;
            std::mem::take(&mut inner.prebuffer)
        };
        for tt in staged {
            self.workshare.push(tt);
        }
        self.workshare.fill_complete();
        self.drain();

        let mut inner = self.inner.lock().expect("sparsedb state poisoned");
        inner.profiles.sort_by_key(|p| p.thread_id);
        let index_base = match &self.profile_index {
            Some(acc) => acc.fetch_add(inner.profiles.len() as u64) as u32,
            None => 0,
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join("profile.db");
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        file.write_all(MAGIC)?;
        let mut out: Vec<u8> = Vec::new();
        out.put_u32_le(VERSION);
        out.put_u32_le(index_base);
        out.put_u32_le(inner.profiles.len() as u32);
        for p in &inner.profiles {
            out.put_u32_le(p.thread_id);
            out.put_u32_le(p.values.len() as u32);
            for &(ctx, vid, value) in &p.values {
                out.put_u32_le(ctx);
                out.put_u32_le(vid);
                out.put_f64_le(value);
            }
        }
        let mut ctxs: Vec<(u32, u64)> = inner.ctx_values.iter().map(|(&c, &n)| (c, n)).collect();
        ctxs.sort_by_key(|&(c, _)| c);
        out.put_u32_le(ctxs.len() as u32);
        for (c, n) in ctxs {
            out.put_u32_le(c);
            out.put_u64_le(n);
        }
        file.write_all(&out)?;
        file.flush()?;
        info!(
            target: "sink.sparsedb",
            path = %path.display(),
            profiles = inner.profiles.len(),
            "wrote sparse value database"
        );
        Ok(())
    }
}
