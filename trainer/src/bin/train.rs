use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use anyhow::{Context, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use distributed::Backend;
use log::{error, info};
use machine_learning::amp::Precision;
use tokio::{signal, task::JoinSet};

use trainer::{Architecture, ClusterConfig, Trainer, TrainerConfig};

const TIMESTAMP: &str = "%Y%m%d-%H%M%S";

#[derive(Parser)]
#[command(name = "train", about = "Distributed image classifier training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trains a network from a random init.
    Scratch(ScratchArgs),
    /// Fine-tunes a network, optionally starting from existing weights.
    Finetune(FinetuneArgs),
}

#[derive(Args)]
struct ScratchArgs {
    /// Base learning rate.
    #[arg(long, default_value_t = 0.025)]
    learning_rate: f32,
    /// Side of the square input images.
    #[arg(long, default_value = "224")]
    input_size: NonZeroUsize,
    #[arg(long, default_value = "120")]
    epochs: NonZeroUsize,
    /// How many ranks take part in the job.
    #[arg(long, default_value = "8")]
    num_tasks: NonZeroUsize,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct FinetuneArgs {
    /// Base learning rate.
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f32,
    /// Side of the square input images.
    #[arg(long, default_value = "384")]
    input_size: NonZeroUsize,
    #[arg(long, default_value = "1")]
    epochs: NonZeroUsize,
    /// How many ranks take part in the job.
    #[arg(long, default_value = "32")]
    num_tasks: NonZeroUsize,
    /// Checkpoint whose model parameters to start from.
    #[arg(long)]
    weights: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Batch size of each rank.
    #[arg(long, default_value = "64")]
    batch: NonZeroUsize,
    /// Cpus per rank, all but one decode samples.
    #[arg(long, default_value = "10")]
    workers: NonZeroUsize,
    /// Folder holding the `train` and `val` image folders.
    #[arg(long, default_value = "/opt/gpu/imagenet")]
    imnet_path: PathBuf,
    /// Folder shared by every rank, checkpoints and rendezvous files go there.
    #[arg(long, default_value = "train_cache")]
    shared_folder_path: PathBuf,
    #[arg(long, default_value = "mlp", value_parser = parse_architecture)]
    architecture: Architecture,
    #[arg(long, default_value = "half", value_parser = parse_precision)]
    precision: Precision,
    #[arg(long, default_value_t = 0)]
    local_rank: usize,
    #[arg(long, default_value_t = 0)]
    global_rank: usize,
    /// Resume this job instead of starting a new one.
    #[arg(long)]
    job_id: Option<String>,
    /// Run every rank of the job in this process, required for more than one task.
    #[arg(long)]
    launch_all: bool,
    /// Let the ranks run ahead of rank 0's evaluation.
    #[arg(long)]
    no_sync_after_eval: bool,
}

fn parse_architecture(s: &str) -> Result<Architecture, String> {
    match s {
        "linear" => Ok(Architecture::Linear),
        "mlp" => Ok(Architecture::Mlp),
        other => Err(format!("unknown architecture {other}, expected linear or mlp")),
    }
}

fn parse_precision(s: &str) -> Result<Precision, String> {
    match s {
        "full" => Ok(Precision::Full),
        "half" => Ok(Precision::Half),
        other => Err(format!("unknown precision {other}, expected full or half")),
    }
}

/// What the subcommands resolve to.
struct Launch {
    train_cfg: TrainerConfig,
    init_folder: PathBuf,
    launch_all: bool,
}

fn is_dir_or_bail(path: &Path, what: &str) -> anyhow::Result<()> {
    if !path.is_dir() {
        bail!("no {what} available at {}", path.display());
    }
    Ok(())
}

impl Launch {
    fn new(command: Command, now: &str) -> anyhow::Result<Self> {
        let (lr, input_size, epochs, num_tasks, weights, common, sub) = match command {
            Command::Scratch(a) => (
                a.learning_rate,
                a.input_size,
                a.epochs,
                a.num_tasks,
                None,
                a.common,
                "training",
            ),
            Command::Finetune(a) => (
                a.learning_rate,
                a.input_size,
                a.epochs,
                a.num_tasks,
                a.weights,
                a.common,
                "finetune",
            ),
        };

        if num_tasks.get() > 1 && !common.launch_all {
            bail!(
                "the {} backend only forms groups within one process, \
                 {num_tasks} tasks need --launch-all",
                Backend::Local
            );
        }

        is_dir_or_bail(&common.shared_folder_path, "shared folder")?;
        is_dir_or_bail(&common.imnet_path, "dataset folder")?;

        let init_folder = common.shared_folder_path.join(sub);
        let save_folder = match sub {
            "finetune" => init_folder.clone(),
            _ => common.shared_folder_path.clone(),
        };
        let job_id = common.job_id.unwrap_or_else(|| now.to_string());

        let mut train_cfg = TrainerConfig::new(common.imnet_path, save_folder, job_id);
        train_cfg.lr = lr;
        train_cfg.input_size = input_size;
        train_cfg.epochs = epochs;
        train_cfg.batch_per_gpu = common.batch;
        train_cfg.workers = common.workers;
        train_cfg.local_rank = common.local_rank;
        train_cfg.global_rank = common.global_rank;
        train_cfg.num_tasks = num_tasks;
        train_cfg.architecture = common.architecture;
        train_cfg.precision = common.precision;
        train_cfg.weights = weights;
        train_cfg.sync_after_eval = !common.no_sync_after_eval;

        Ok(Self {
            train_cfg,
            init_folder,
            launch_all: common.launch_all,
        })
    }

    /// The configuration of every rank this process runs.
    fn ranks(&self) -> Vec<TrainerConfig> {
        if !self.launch_all {
            return vec![self.train_cfg.clone()];
        }

        (0..self.train_cfg.num_tasks.get())
            .map(|rank| {
                let mut cfg = self.train_cfg.clone();
                cfg.local_rank = rank;
                cfg.global_rank = rank;
                cfg
            })
            .collect()
    }
}

/// Runs one rank, a failed job is reported and swallowed unless the failure is fatal.
fn run_rank(train_cfg: TrainerConfig, cluster_cfg: ClusterConfig) -> anyhow::Result<()> {
    let rank = train_cfg.global_rank;
    let mut trainer = Trainer::new(Arc::new(train_cfg), cluster_cfg);

    match trainer.run() {
        Ok(Some(accuracy)) => info!("Validation accuracy: {accuracy}"),
        Ok(None) => {}
        Err(e) if e.is_fatal() => {
            return Err(e).with_context(|| format!("rank {rank} could not start"));
        }
        Err(e) => error!(rank = rank; "Job failed: {e}"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let now = Local::now().format(TIMESTAMP).to_string();
    let launch = Launch::new(cli.command, &now)?;

    fs::create_dir_all(&launch.init_folder)?;
    let init_file = launch.init_folder.join(&now);
    if init_file.exists() {
        fs::remove_file(&init_file)?;
    }

    let cluster_cfg = ClusterConfig::with_init_file(Backend::Local, &init_file);
    info!(job_id = launch.train_cfg.job_id.as_str(); "rendezvous at {}", cluster_cfg.dist_url);

    let mut jobs = JoinSet::new();
    for cfg in launch.ranks() {
        let cluster_cfg = cluster_cfg.clone();
        jobs.spawn_blocking(move || run_rank(cfg, cluster_cfg));
    }

    let all = async {
        while let Some(job) = jobs.join_next().await {
            job??;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        ret = all => {
            if let Err(e) = ret {
                error!("{e:#}");
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT, aborting");
            process::exit(130);
        }
    }

    Ok(())
}
