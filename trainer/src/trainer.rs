use std::{fs, io, num::NonZeroUsize, sync::Arc, time::Instant};

use distributed::{Device, ProcessGroup};
use log::{debug, info, warn};
use machine_learning::{
    amp::LossScaler,
    arch::{
        Model,
        loss::{CrossEntropy, LossFn, top1_correct},
    },
    optimization::Sgd,
    scheduler::StepLr,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    ClusterConfig, DistributedModel, Result, TrainErr, TrainerConfig, arch, config,
    data::{Batch, DataLoader, Dataset, FolderDataset, RaSampler, Transform},
    metrics::{EpochMetrics, EvalMetrics},
    state::{Checkpoint, TrainerState},
};

const MOMENTUM: f32 = 0.9;
const WEIGHT_DECAY: f32 = 1e-4;
const LR_STEP_SIZE: NonZeroUsize = config::nz(30);
const LR_GAMMA: f32 = 0.1;
/// Every how many epochs rank 0 evaluates, besides the last one.
const EVAL_EVERY: usize = 10;

/// The live objects of an initialized job.
pub struct Session {
    pub state: TrainerState,
    pub train_loader: DataLoader,
    pub test_loader: DataLoader,
}

/// Runs one rank of a training job.
pub struct Trainer {
    train_cfg: Arc<TrainerConfig>,
    cluster_cfg: ClusterConfig,
    group: Option<Arc<dyn ProcessGroup>>,
}

impl Trainer {
    pub fn new(train_cfg: Arc<TrainerConfig>, cluster_cfg: ClusterConfig) -> Self {
        Self {
            train_cfg,
            cluster_cfg,
            group: None,
        }
    }

    pub fn train_cfg(&self) -> &TrainerConfig {
        &self.train_cfg
    }

    pub fn cluster_cfg(&self) -> &ClusterConfig {
        &self.cluster_cfg
    }

    /// Runs the whole job: joins the group, restores or creates the state and trains.
    ///
    /// # Returns
    /// The final validation accuracy on rank 0, `None` on every other rank.
    pub fn run(&mut self) -> Result<Option<f32>> {
        self.train_cfg.validate()?;
        self.setup_process_group()?;
        let mut session = self.init_state()?;
        self.train(&mut session)
    }

    /// Binds the rank to its device and joins the process group.
    ///
    /// Blocks until every rank has joined. A failure here is fatal, there is no retry.
    pub fn setup_process_group(&mut self) -> Result<Arc<dyn ProcessGroup>> {
        let cfg = &self.train_cfg;
        Device::bind(cfg.local_rank);

        let group = distributed::init_process_group(
            self.cluster_cfg.dist_backend,
            &self.cluster_cfg.dist_url,
            cfg.num_tasks.get(),
            cfg.global_rank,
            self.cluster_cfg.timeout,
        )
        .map_err(TrainErr::ProcessGroup)?;

        let group: Arc<dyn ProcessGroup> = Arc::from(group);
        info!(
            rank = cfg.global_rank, world_size = cfg.num_tasks.get();
            "training in distributed mode with multiple processes, 1 device per process"
        );

        self.group = Some(Arc::clone(&group));
        Ok(group)
    }

    fn group(&self) -> Result<Arc<dyn ProcessGroup>> {
        self.group.clone().ok_or_else(|| {
            TrainErr::InvalidConfig("the process group must be set up first".to_string())
        })
    }

    /// Builds the data loaders and a fresh state, then restores the job's latest checkpoint
    /// if there is one.
    ///
    /// Must run on the thread that set up the process group, which holds the device binding.
    pub fn init_state(&self) -> Result<Session> {
        let cfg = &self.train_cfg;
        let group = self.group()?;
        let device = match Device::current() {
            Some(device) if device.index() == cfg.local_rank => device,
            Some(device) => {
                return Err(TrainErr::InvalidConfig(format!(
                    "bound to device {} but the local rank is {}",
                    device.index(),
                    cfg.local_rank
                )));
            }
            None => {
                return Err(TrainErr::InvalidConfig(
                    "the calling thread is not bound to a device".to_string(),
                ));
            }
        };
        let side = cfg.input_size.get();
        let loader_threads = cfg.workers.get().saturating_sub(1).max(1);

        info!("create data loaders");
        info!(input_size = side, lr = cfg.lr; "initial settings");

        let train_set: Arc<dyn Dataset> = Arc::new(FolderDataset::open(&cfg.train_folder(), side)?);
        let test_set: Arc<dyn Dataset> = Arc::new(FolderDataset::open(&cfg.val_folder(), side)?);

        if train_set.num_classes() != test_set.num_classes() {
            return Err(TrainErr::InvalidConfig(format!(
                "train has {} classes but val has {}",
                train_set.num_classes(),
                test_set.num_classes()
            )));
        }

        let sampler = RaSampler::new(train_set.len(), cfg.num_tasks, cfg.global_rank, cfg.batch_per_gpu)?
            .repetitions(cfg.repetitions)
            .len_factor(cfg.len_factor)
            .shuffle(true)
            .drop_last(false)
            .seed(cfg.seed);

        let train_loader = DataLoader::with_sampler(
            Arc::clone(&train_set),
            sampler,
            Transform::train(side),
            loader_threads,
            cfg.seed,
        )?;
        let test_loader = DataLoader::sequential(
            test_set,
            cfg.batch_per_gpu.get(),
            Transform::val(side),
            loader_threads,
        )?;

        info!(
            device = device.index(), total_batch_size = cfg.global_batch();
            "create distributed model"
        );

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut module = arch::build(cfg.architecture, side, train_set.num_classes(), &mut rng)?;

        if let Some(weights) = &cfg.weights {
            info!("load model weights from {}", weights.display());
            module.load_state_dict(&Checkpoint::read(weights)?.model)?;
        }

        let optimizer = Sgd::new(module.size(), cfg.scaled_lr(), MOMENTUM, WEIGHT_DECAY);
        let lr_scheduler = StepLr::new(&optimizer, LR_STEP_SIZE, LR_GAMMA);
        let model = DistributedModel::new(module, LossScaler::new(cfg.precision), group);
        let mut state = TrainerState::new(model, optimizer, lr_scheduler);

        let checkpoint = cfg.checkpoint_path();
        if checkpoint.is_file() {
            info!("load existing checkpoint from {}", checkpoint.display());
            state = TrainerState::load(&checkpoint, state)?;
        }

        if cfg.global_rank == 0 {
            cfg.save()?;
        }

        Ok(Session {
            state,
            train_loader,
            test_loader,
        })
    }

    /// Trains from the state's epoch to the last one.
    ///
    /// Rank 0 evaluates and checkpoints every `EVAL_EVERY` epochs and after the last one.
    ///
    /// # Returns
    /// The accuracy of the last epoch on rank 0, `None` on every other rank.
    pub fn train(&self, session: &mut Session) -> Result<Option<f32>> {
        let cfg = &self.train_cfg;
        let group = self.group()?;
        let is_main = cfg.global_rank == 0;
        let mut rm_init = true;
        let mut accuracy = None;

        for epoch in session.state.epoch..cfg.epochs.get() {
            let metrics = self.train_epoch(session, epoch)?;

            match metrics.fps() {
                Some(fps) => info!(epoch = epoch, batches = metrics.batches; "{fps:.1} fps"),
                None => info!(epoch = epoch, batches = metrics.batches; "epoch done"),
            }

            let last = cfg.is_last_epoch(epoch);
            if is_main && ((epoch + 1) % EVAL_EVERY == 0 || last) {
                let eval = self.evaluate(session)?;
                let acc = eval.accuracy();

                info!(
                    "accuracy of the network on the {} test images: {:.1}%",
                    eval.total,
                    acc * 100.
                );
                info!(
                    "loss of the network on the {} test images: {:.3}",
                    eval.total,
                    eval.mean_loss()
                );

                session.state.accuracy = acc;
                self.checkpoint(&session.state, rm_init)?;
                rm_init = false;

                if last {
                    accuracy = Some(acc);
                }
            }

            if cfg.sync_after_eval {
                group.barrier()?;
            }
        }

        Ok(accuracy)
    }

    /// Runs the batch loop of `epoch`.
    ///
    /// Stops early once the rank consumed its share of the canonical epoch size.
    pub fn train_epoch(&self, session: &mut Session, epoch: usize) -> Result<EpochMetrics> {
        let cfg = &self.train_cfg;
        let Session {
            state,
            train_loader,
            ..
        } = session;

        info!(epoch = epoch; "start epoch");
        state.model.train();
        state.lr_scheduler.step(&mut state.optimizer, epoch);
        state.epoch = epoch;
        train_loader.set_epoch(epoch);

        let criterion = CrossEntropy::new();
        let cap = cfg.batches_per_epoch_cap();
        let mut metrics = EpochMetrics::default();
        let mut count = 0usize;
        let mut end = Instant::now();

        for (i, batch) in train_loader.iter().enumerate() {
            let batch = batch?;
            let loss = train_step(state, &criterion, &batch)?;
            count += 1;

            if let Some(mean) = metrics.record_loss(i, loss, batch.len()) {
                if cfg.global_rank == 0 {
                    info!(
                        "[{epoch:02}, {i:05}] loss: {mean:.3} time: {:.3}",
                        end.elapsed().as_secs_f64()
                    );
                }
            }

            if count as f64 >= cap {
                debug!(epoch = epoch, batches = count; "reached the canonical epoch size");
                break;
            }

            metrics.record_throughput(batch.len() * cfg.num_tasks.get(), end.elapsed());
            end = Instant::now();
        }

        Ok(metrics)
    }

    /// Measures top-1 accuracy and mean loss on the validation set.
    pub fn evaluate(&self, session: &mut Session) -> Result<EvalMetrics> {
        info!("start evaluation of the model");

        let criterion = CrossEntropy::new();
        let model = &mut session.state.model;
        model.eval();

        let mut metrics = EvalMetrics::default();
        for batch in session.test_loader.iter() {
            let batch = batch?;
            let outputs = model.forward(batch.x.view())?;
            let loss = criterion.loss(outputs.view(), &batch.labels)?;

            metrics.record(top1_correct(outputs.view(), &batch.labels), batch.len(), loss);
        }

        Ok(metrics)
    }

    /// Saves `state` as the job's latest checkpoint and as the checkpoint of its epoch.
    ///
    /// # Arguments
    /// * `state` - The state to persist.
    /// * `rm_init` - Whether to also remove the rendezvous file, which is no longer needed once
    ///   the group is formed.
    pub fn checkpoint(&self, state: &TrainerState, rm_init: bool) -> Result<()> {
        let cfg = &self.train_cfg;
        fs::create_dir_all(cfg.job_folder())?;

        state.save(&cfg.checkpoint_path())?;
        state.save(&cfg.epoch_checkpoint_path(state.epoch))?;
        info!(epoch = state.epoch; "checkpoint saved");

        if !rm_init {
            return Ok(());
        }

        let Some(init_file) = self.cluster_cfg.init_file() else {
            return Ok(());
        };

        match fs::remove_file(&init_file) {
            Ok(()) => debug!("removed rendezvous file {}", init_file.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("rendezvous file {} was already gone", init_file.display())
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}

/// Forward, loss, backward-and-sync and optimizer step for one batch.
///
/// # Returns
/// The batch loss.
fn train_step(state: &mut TrainerState, criterion: &CrossEntropy, batch: &Batch) -> Result<f32> {
    let outputs = state.model.forward(batch.x.view())?;
    let loss = criterion.loss(outputs.view(), &batch.labels)?;
    let d = criterion.loss_prime(outputs.view(), &batch.labels)?;

    state.model.zero_grad();
    let found_inf = state.model.backward_and_sync(d)?;
    state.model.step(&mut state.optimizer, found_inf)?;

    Ok(loss)
}
