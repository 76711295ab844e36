//! Profusion entrypoint: parse arguments, install logging, assemble the
//! pipeline, run, and exit nonzero on fatal failure.

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use prof_collective::{Collective, RankTree, SharedAccumulator, Standalone, Tag};
use prof_finalizers::{BinarySymbols, DenseIds, KernelSymbols, StandardStatistics, StructFile};
use prof_pipeline::PipelineBuilder;
use prof_sinks::{IdPacker, MetaDB, MetricSender, MetricsYaml, SparseDB, TreeSender};
use prof_sources::{IdTracker, IdUnpacker, MetricReceiver, Receiver, SampleFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "profusion", version, about = "Parallel profile-analysis engine")]
struct Args {
    /// Measurement documents to analyze.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output database directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Binary structure files (classification and call-graph recovery).
    #[arg(short = 'S', long = "structs")]
    structs: Vec<PathBuf>,

    /// Symbol-table dumps, as `<module-path>=<dump-path>`.
    #[arg(long = "syms")]
    syms: Vec<String>,

    /// Kernel symbol map (kallsyms shape).
    #[arg(long = "kernel-syms")]
    kernel_syms: Option<PathBuf>,

    /// Worker team size; defaults to the available parallelism.
    #[arg(short = 'j', long)]
    team: Option<usize>,

    /// Rank-tree arity for the cluster reduction phase.
    #[arg(long)]
    arity: Option<usize>,

    /// Also append logs to this file.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Configuration file (overrides discovery of `profusion.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Defaults from `profusion.toml`; the command line wins.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    output: Option<PathBuf>,
    #[serde(default)]
    team: Option<usize>,
    #[serde(default)]
    arity: Option<usize>,
}

fn load_config(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from("profusion.toml");
            if !p.is_file() {
                return Ok(ConfigFile::default());
            }
            p
        }
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("malformed config {}", path.display()))
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            base.with_writer(writer).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            base.init();
            Ok(None)
        }
    }
}

struct Setup {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    structs: Vec<PathBuf>,
    syms: Vec<(PathBuf, PathBuf)>,
    kernel_syms: Option<PathBuf>,
    team: usize,
    arity: usize,
}

impl Setup {
    fn from(args: Args, cfg: ConfigFile) -> Result<Self> {
        let mut syms = Vec::new();
        for s in &args.syms {
            let Some((module, dump)) = s.split_once('=') else {
                bail!("--syms expects <module-path>=<dump-path>, got {s:?}");
            };
            syms.push((PathBuf::from(module), PathBuf::from(dump)));
        }
        Ok(Setup {
            inputs: args.inputs,
            output: args
                .output
                .or(cfg.output)
                .unwrap_or_else(|| PathBuf::from("profusion.d")),
            structs: args.structs,
            syms,
            kernel_syms: args.kernel_syms,
            team: args.team.or(cfg.team).unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, |n| n.get())
            }),
            arity: args.arity.or(cfg.arity).unwrap_or(8),
        })
    }

    /// The classification chain, in lookup order: structure files, symbol
    /// tables, kernel symbols. The symbol-table classifier is always
    /// registered (even with nothing loaded) so the chain exists for every
    /// assembly; unmatched modules simply stay unclassified.
    fn add_classifiers(&self, b: &mut PipelineBuilder) -> Result<()> {
        for path in &self.structs {
            match StructFile::new(path) {
                Ok(sf) => {
                    b.add_finalizer(Box::new(sf));
                }
                Err(e) => warn!(error = %e, "skipping structure file"),
            }
        }
        let mut bs = BinarySymbols::new();
        for (module, dump) in &self.syms {
            if let Err(e) = bs.load(module, dump) {
                warn!(error = %e, "skipping symbol table");
            }
        }
        b.add_finalizer(Box::new(bs));
        if let Some(path) = &self.kernel_syms {
            match KernelSymbols::new(path) {
                Ok(ks) => {
                    b.add_finalizer(Box::new(ks));
                }
                Err(e) => warn!(error = %e, "skipping kernel symbol map"),
            }
        }
        Ok(())
    }

    fn add_inputs(&self, b: &mut PipelineBuilder) -> Result<usize> {
        let mut opened = 0;
        for path in &self.inputs {
            match SampleFile::open(path) {
                Ok(src) => {
                    b.add_source(Box::new(src));
                    opened += 1;
                }
                Err(e) => warn!(error = %e, "skipping measurement document"),
            }
        }
        if opened == 0 {
            bail!("no readable measurement documents");
        }
        Ok(opened)
    }
}

/// Single-process analysis: one pipeline, all sinks local.
fn run_single(setup: &Setup) -> Result<()> {
    let mut b = PipelineBuilder::new();
    setup.add_classifiers(&mut b)?;
    b.add_finalizer(Box::new(DenseIds::new()));
    b.add_finalizer(Box::new(StandardStatistics::full()));
    let n = setup.add_inputs(&mut b)?;
    b.add_sink(Box::new(MetaDB::new(setup.output.clone())));
    b.add_sink(Box::new(SparseDB::new(setup.output.clone())));
    b.add_sink(Box::new(MetricsYaml::new(setup.output.clone())));
    info!(inputs = n, team = setup.team, "running standalone analysis");
    b.build(setup.team).run()?;
    Ok(())
}

/// Cluster reduction over a collective backend: identifiers reduce up the
/// rank tree and broadcast down first, then every rank re-reads its
/// measurements under the shared identifiers and metric values reduce to
/// the root, which writes the database.
fn run_reduction(setup: &Setup, collective: Arc<dyn Collective>) -> Result<()> {
    let rank = collective.rank();
    let tree = RankTree::new(rank, collective.size(), setup.arity);
    info!(rank, size = collective.size(), arity = tree.arity, "running cluster reduction");

    // Phase 1: merge structure and identifiers toward the root, then
    // broadcast the root's packed view of them to everyone.
    let blob = {
        let mut b = PipelineBuilder::new();
        setup.add_classifiers(&mut b)?;
        b.add_finalizer(Box::new(DenseIds::new()));
        b.add_finalizer(Box::new(StandardStatistics::full()));
        setup.add_inputs(&mut b)?;
        Receiver::append(&mut b, &collective, tree);
        if rank == 0 {
            let stash: Arc<std::sync::Mutex<Option<Vec<u8>>>> = Default::default();
            let bcast = collective.clone();
            let stash_in = stash.clone();
            b.add_sink(Box::new(IdPacker::new(Box::new(move |data: Vec<u8>| {
                *stash_in.lock().expect("blob stash poisoned") = Some(data.clone());
                bcast.bcast_bytes(data, 0);
            }))));
            b.build(setup.team).run()?;
            let blob = stash.lock().expect("blob stash poisoned").take();
            blob.context("rank 0 never packed its identifiers")?
        } else {
            b.add_sink(Box::new(TreeSender::new(collective.clone(), tree)));
            b.build(setup.team).run()?;
            collective.bcast_bytes(Vec::new(), 0)
        }
    };

    // Phase 2: every rank replays under the shared identifiers; metric
    // values reduce up the tree to the root's database sinks.
    let profile_index = Arc::new(SharedAccumulator::new(collective.clone(), Tag::SPARSE_DB));
    profile_index.initialize(0);

    let mut b = PipelineBuilder::new();
    // The packed format pins classification flat, so the classifier chain
    // stays out of this phase; structure came along in phase 1.
    b.add_finalizer(Box::new(IdUnpacker::new(blob)));
    b.add_finalizer(Box::new(DenseIds::new()));
    b.add_finalizer(Box::new(StandardStatistics::full()));
    setup.add_inputs(&mut b)?;
    let (tracker, maps) = IdTracker::new();
    MetricReceiver::append(&mut b, &collective, tree, &maps, None, true);
    b.add_sink(Box::new(tracker));
    if rank == 0 {
        b.add_sink(Box::new(MetaDB::new(setup.output.clone())));
        b.add_sink(Box::new(
            SparseDB::new(setup.output.clone()).with_profile_index(profile_index.clone()),
        ));
        b.add_sink(Box::new(MetricsYaml::new(setup.output.clone())));
    } else {
        b.add_sink(Box::new(MetricSender::new(collective.clone(), tree, true)));
    }
    b.build(setup.team).run()?;
    collective.barrier();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config(args.config.as_deref())?;
    let _log_guard = init_logging(args.log_file.as_deref())?;
    let setup = Setup::from(args, cfg)?;

    // The collective backend is an external collaborator; without one the
    // standalone world runs the whole analysis in this process.
    let collective: Arc<dyn Collective> = Arc::new(Standalone);
    if collective.size() > 1 {
        run_reduction(&setup, collective)
    } else {
        run_single(&setup)
    }
}
