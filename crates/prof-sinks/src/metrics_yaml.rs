//! The metric taxonomy, as YAML for the presentation layer.
//!
//! Everything is produced during the attributes wavefront; `write` only
//! reports any deferred I/O failure. One file, `metrics/default.yaml`,
//! lists every metric with its variants (one per Statistic) and the purely
//! derived extra statistics with their formulas.

use prof_model::{DataClass, ExtensionClass, Metric, MetricScopeSet, MetricVisibility};
use prof_pipeline::{ProfileSink, SinkHandle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Serialize)]
struct TaxonomyDoc {
    version: u32,
    metrics: Vec<MetricEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_statistics: Vec<ExtraStatisticEntry>,
}

#[derive(Serialize)]
struct MetricEntry {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    visibility: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    order: Option<u64>,
    scopes: Vec<&'static str>,
    variants: Vec<VariantEntry>,
}

#[derive(Serialize)]
struct VariantEntry {
    name: String,
    render: &'static str,
    formula: String,
}

#[derive(Serialize)]
struct ExtraStatisticEntry {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    scopes: Vec<&'static str>,
    formula: String,
}

fn scope_names(scopes: MetricScopeSet) -> Vec<&'static str> {
    let mut out = Vec::new();
    if scopes.contains(MetricScopeSet::POINT) {
        out.push("point");
    }
    if scopes.contains(MetricScopeSet::FUNCTION) {
        out.push("function");
    }
    if scopes.contains(MetricScopeSet::LEX_AWARE) {
        out.push("lex_aware");
    }
    if scopes.contains(MetricScopeSet::EXECUTION) {
        out.push("execution");
    }
    out
}

fn visibility_name(v: MetricVisibility) -> &'static str {
    match v {
        MetricVisibility::Shown => "shown",
        MetricVisibility::HiddenByDefault => "hidden by default",
        MetricVisibility::Invisible => "invisible",
    }
}

fn metric_entry(m: &Arc<Metric>) -> MetricEntry {
    let s = m.settings();
    let variants = m
        .statistics()
        .iter()
        .map(|st| VariantEntry {
            name: st.suffix.clone(),
            render: if st.show_percent { "percent" } else { "number" },
            formula: st.finalize.render(&|i| format!("$p{i}")),
        })
        .collect();
    MetricEntry {
        name: s.name.clone(),
        description: s.description.clone(),
        visibility: visibility_name(s.visibility),
        order: s.order_id,
        scopes: scope_names(s.scopes),
        variants,
    }
}

/// Sink writing `metrics/default.yaml` into the database directory.
pub struct MetricsYaml {
    dir: PathBuf,
    handle: Option<SinkHandle>,
    deferred_error: Mutex<Option<std::io::Error>>,
}

impl MetricsYaml {
    pub fn new(dir: PathBuf) -> Self {
        MetricsYaml { dir, handle: None, deferred_error: Mutex::new(None) }
    }

    fn emit(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().expect("sink not bound");
        let mut metrics = h.metrics();
        metrics.sort_by(|a, b| {
            let (sa, sb) = (a.settings(), b.settings());
            (sa.order_id.unwrap_or(u64::MAX), &sa.name)
                .cmp(&(sb.order_id.unwrap_or(u64::MAX), &sb.name))
        });
        let estats = h.extra_statistics();

        let doc = TaxonomyDoc {
            version: 1,
            metrics: metrics.iter().map(metric_entry).collect(),
            extra_statistics: estats
                .iter()
                .map(|es| ExtraStatisticEntry {
                    name: es.name.clone(),
                    description: es.description.clone(),
                    scopes: scope_names(es.scopes),
                    formula: es
                        .formula
                        .render(&|i| format!("\"{}\"", es.metrics[i as usize].name())),
                })
                .collect(),
        };

        let dir = self.dir.join("metrics");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("default.yaml");
        let file = std::fs::File::create(&path)?;
        serde_yaml::to_writer(std::io::BufWriter::new(file), &doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        info!(
            target: "sink.metricsyaml",
            path = %path.display(),
            metrics = doc.metrics.len(),
            "wrote metric taxonomy"
        );
        Ok(())
    }
}

impl ProfileSink for MetricsYaml {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }

    fn accepts(&self) -> DataClass {
        DataClass::ATTRIBUTES
    }
    fn wavefronts(&self) -> DataClass {
        self.accepts()
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn notify_wavefront(&self, delivered: DataClass) {
        if !delivered.has_attributes() {
            return;
        }
        if let Err(e) = self.emit() {
            *self.deferred_error.lock().expect("error slot poisoned") = Some(e);
        }
    }

    fn write(&self) -> std::io::Result<()> {
        match self.deferred_error.lock().expect("error slot poisoned").take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
