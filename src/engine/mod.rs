//! Run orchestration
//!
//! The [`Engine`] wires dataloaders, model, losses, metrics, optimizer,
//! mixed precision, EMA and checkpointing together for exactly one mode.
//! Construction performs all conditional wiring up front; after `build()`
//! succeeds the mode's entry point (`train`, `eval`, `infer`, `export`)
//! can be driven without further configuration lookups failing.

mod amp;
mod evaluation;
mod export;
mod infer;
mod seed;
mod train;

pub use amp::{AmpConfig, AmpLevel, LossScaler};
pub use export::{Activation, ExportedModel};
pub use infer::{NumericFilePreprocessor, Preprocessor};
pub use seed::{RngState, DEFAULT_SEED};

use crate::arch::{build_model, Model};
use crate::config::Config;
use crate::data::{DataLoader, DataLoaderFactory, InMemoryLoaderFactory, Topk};
use crate::ema::ExponentialMovingAverage;
use crate::io::{Checkpointer, JsonCheckpointer, MetricInfo};
use crate::loss::{build_loss, CombinedLoss};
use crate::memory::CrossBatchMemory;
use crate::metric::{build_metrics, Metric};
use crate::optim::{build_optimizer, build_scheduler, LRScheduler, Optimizer};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Run mode, fixed at construction. A new engine is built per mode;
/// `train` internally runs `eval` as a nested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Infer,
    Export,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "eval" => Ok(Self::Eval),
            "infer" => Ok(Self::Infer),
            "export" => Ok(Self::Export),
            other => Err(Error::config(
                "mode",
                format!("mode `{other}` must be one of [train, eval, infer, export]"),
            )),
        }
    }
}

/// Evaluation routine, selected once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Classification,
    Retrieval,
    Adaface,
}

impl FromStr for EvalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "classification" => Ok(Self::Classification),
            "retrieval" => Ok(Self::Retrieval),
            "adaface" => Ok(Self::Adaface),
            other => Err(Error::config(
                "Global.eval_mode",
                format!(
                    "eval_mode `{other}` must be one of [classification, retrieval, adaface]"
                ),
            )),
        }
    }
}

/// Per-epoch training strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainMode {
    Standard,
    /// Extend each step's contrastive batch with the cross-batch memory
    CrossBatchMemory,
}

impl FromStr for TrainMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(Self::Standard),
            "xbm" => Ok(Self::CrossBatchMemory),
            other => Err(Error::config(
                "Global.train_mode",
                format!("train_mode `{other}` must be one of [standard, xbm]"),
            )),
        }
    }
}

/// World-size assumptions of the reference configurations; anything else
/// is a non-fatal warning.
const REFERENCE_GPUS_ADAMW: usize = 8;
const REFERENCE_GPUS_DEFAULT: usize = 4;

/// Per-mode builder: collaborators are injectable, everything else comes
/// from the config.
pub struct EngineBuilder {
    config: Config,
    mode: Mode,
    rank: usize,
    world_size: usize,
    loader_factory: Box<dyn DataLoaderFactory>,
    checkpointer: Box<dyn Checkpointer>,
    preprocessor: Box<dyn Preprocessor>,
}

impl EngineBuilder {
    pub fn new(config: Config, mode: Mode) -> Self {
        Self {
            config,
            mode,
            rank: 0,
            world_size: 1,
            loader_factory: Box::new(InMemoryLoaderFactory),
            checkpointer: Box::new(JsonCheckpointer),
            preprocessor: Box::new(NumericFilePreprocessor),
        }
    }

    pub fn rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    pub fn world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size.max(1);
        self
    }

    pub fn loader_factory(mut self, factory: Box<dyn DataLoaderFactory>) -> Self {
        self.loader_factory = factory;
        self
    }

    pub fn checkpointer(mut self, checkpointer: Box<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    pub fn preprocessor(mut self, preprocessor: Box<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn build(self) -> Result<Engine> {
        Engine::construct(self)
    }
}

/// The orchestration core: owns every subsystem its mode requires.
pub struct Engine {
    pub(crate) config: Config,
    mode: Mode,
    eval_mode: EvalMode,
    train_mode: TrainMode,
    rank: usize,
    world_size: usize,
    distributed: bool,
    rng: RngState,
    output_dir: PathBuf,

    model: Box<dyn Model>,
    class_num: usize,

    train_loader: Option<Box<dyn DataLoader>>,
    unlabel_loader: Option<Box<dyn DataLoader>>,
    eval_loader: Option<Box<dyn DataLoader>>,
    gallery_loader: Option<Box<dyn DataLoader>>,
    query_loader: Option<Box<dyn DataLoader>>,

    train_loss: Option<CombinedLoss>,
    unlabel_loss: Option<CombinedLoss>,
    eval_loss: Option<CombinedLoss>,
    train_metrics: Vec<Box<dyn Metric>>,
    eval_metrics: Vec<Box<dyn Metric>>,

    optimizer: Option<Box<dyn Optimizer>>,
    scheduler: Option<Box<dyn LRScheduler>>,
    amp: Option<AmpConfig>,
    scaler: Option<LossScaler>,
    ema: Option<ExponentialMovingAverage>,
    xbm: Option<CrossBatchMemory>,

    checkpointer: Box<dyn Checkpointer>,
    preprocessor: Box<dyn Preprocessor>,
    postprocess: Option<Topk>,

    epochs: usize,
    iter_per_epoch: Option<usize>,
    start_eval_epoch: usize,
    eval_interval: usize,
    eval_during_train: bool,
    save_interval: usize,
    update_freq: usize,

    best_metric: MetricInfo,
    best_metric_ema: MetricInfo,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Engine {
    fn construct(builder: EngineBuilder) -> Result<Self> {
        let EngineBuilder {
            config,
            mode,
            rank,
            world_size,
            loader_factory,
            checkpointer,
            preprocessor,
        } = builder;

        // seed first: everything downstream draws from this state
        let configured_seed = config.get_u64_opt("Global.seed")?;
        let mut rng = RngState::resolve(configured_seed, rank, world_size);

        let eval_mode: EvalMode = config
            .get_str_or("Global.eval_mode", "classification")?
            .parse()?;
        let train_mode: TrainMode = config.get_str_or("Global.train_mode", "standard")?.parse()?;
        let output_dir = PathBuf::from(config.get_str_or("Global.output_dir", "./output")?);

        let class_num = Self::resolve_class_num(&config)?;

        // dataloaders, mode-dependent
        let mut train_loader = None;
        let mut unlabel_loader = None;
        let mut eval_loader = None;
        let mut gallery_loader = None;
        let mut query_loader = None;
        let seed = rng.seed();
        match mode {
            Mode::Train => {
                train_loader = Some(loader_factory.build(&config, "DataLoader.Train", seed)?);
                if config.get("DataLoader.UnLabelTrain").is_some() {
                    unlabel_loader =
                        Some(loader_factory.build(&config, "DataLoader.UnLabelTrain", seed)?);
                }
                if config.get_bool_or("Global.eval_during_train", true)? {
                    Self::build_eval_loaders(
                        &config,
                        &*loader_factory,
                        eval_mode,
                        seed,
                        &mut eval_loader,
                        &mut gallery_loader,
                        &mut query_loader,
                    )?;
                }
            }
            Mode::Eval => {
                Self::build_eval_loaders(
                    &config,
                    &*loader_factory,
                    eval_mode,
                    seed,
                    &mut eval_loader,
                    &mut gallery_loader,
                    &mut query_loader,
                )?;
            }
            Mode::Infer | Mode::Export => {}
        }

        // losses
        let train_loss = match mode {
            Mode::Train => Some(build_loss(&config, "Loss.Train")?),
            _ => None,
        };
        let unlabel_loss = match mode {
            Mode::Train if config.get("Loss.UnLabelTrain").is_some() => {
                Some(build_loss(&config, "Loss.UnLabelTrain")?)
            }
            _ => None,
        };
        let eval_loss = match mode {
            Mode::Train | Mode::Eval if config.get("Loss.Eval").is_some() => {
                Some(build_loss(&config, "Loss.Eval")?)
            }
            _ => None,
        };

        // metrics, each independently optional
        let train_metrics = match mode {
            Mode::Train => Self::checked_metrics(&config, "Metric.Train", train_loader.as_deref())?,
            _ => Vec::new(),
        };
        let eval_metrics = match mode {
            Mode::Train | Mode::Eval => {
                Self::checked_metrics(&config, "Metric.Eval", eval_loader.as_deref())?
            }
            _ => Vec::new(),
        };

        // model, then pretrained weights
        let mut model = build_model(&config, class_num, &mut rng)?;
        if config.get_bool_or("Global.to_static", false)? {
            println!(
                "warning: Global.to_static requested but static-graph compilation is unavailable, running dynamic"
            );
        }
        if let Some(pretrained) = config.get_str_opt("Global.pretrained_model")? {
            checkpointer.load_pretrained(&pretrained, model.as_mut())?;
            println!("loaded pretrained weights from {pretrained}");
        }

        // optimizer and schedule, train only
        let (optimizer, scheduler) = match mode {
            Mode::Train => {
                let epochs = config.get_usize_or("Global.epochs", 1)?;
                let optimizer = build_optimizer(&config)?;
                let scheduler = build_scheduler(&config, epochs)?;
                let reference = if config.get_str_or("Optimizer.name", "Momentum")? == "AdamW" {
                    REFERENCE_GPUS_ADAMW
                } else {
                    REFERENCE_GPUS_DEFAULT
                };
                if world_size > 1 && world_size != reference {
                    println!(
                        "warning: reference configs assume {reference} workers, running with {world_size}; tune the learning rate accordingly"
                    );
                }
                (Some(optimizer), Some(scheduler))
            }
            _ => (None, None),
        };

        let amp = AmpConfig::from_config(&config)?;
        let scaler = match (&amp, mode) {
            (Some(a), Mode::Train) => Some(LossScaler::new(a.scale_loss)),
            _ => None,
        };

        let ema = match mode {
            Mode::Train if config.get("EMA").is_some() => {
                let decay = config.get_f64_or("EMA.decay", 0.9999)? as f32;
                Some(ExponentialMovingAverage::new(model.as_ref(), decay)?)
            }
            _ => None,
        };

        let xbm = match (mode, train_mode) {
            (Mode::Train, TrainMode::CrossBatchMemory) => {
                let feat_dim = train_loss
                    .as_ref()
                    .and_then(CombinedLoss::contrastive_feat_dim)
                    .ok_or_else(|| {
                        Error::config(
                            "Global.train_mode",
                            "xbm training needs a ContrastiveLoss in Loss.Train",
                        )
                    })?;
                let size = config.get_usize_or("Global.xbm_size", 1024)?;
                Some(CrossBatchMemory::new(size, feat_dim)?)
            }
            _ => None,
        };

        let distributed = world_size > 1;
        if distributed {
            // parameter synchronization itself lives in the collective layer;
            // the engine only records that wrapping happened
            println!("running data-parallel: rank {rank} of {world_size}");
        }

        // infer pipelines last
        let postprocess = match mode {
            Mode::Infer => {
                let topk = config.get_usize_or("Infer.PostProcess.topk", 5)?;
                let mut post = Topk::new(topk)?;
                if let Some(map_file) = config.get_str_opt("Infer.PostProcess.class_id_map_file")? {
                    post = post.with_class_id_map(Path::new(&map_file))?;
                }
                Some(post)
            }
            _ => None,
        };

        let epochs = config.get_usize_or("Global.epochs", 1)?;
        let iter_per_epoch = config.get_u64_opt("Global.iter_per_epoch")?.map(|n| n as usize);
        let mut update_freq = config.get_usize_or("Global.update_freq", 1)?.max(1);
        if let Some(loader) = train_loader.as_deref() {
            let iters = iter_per_epoch.unwrap_or_else(|| loader.len());
            if update_freq > iters {
                println!(
                    "warning: update_freq {update_freq} exceeds the {iters} steps of one epoch, resetting to 1"
                );
                update_freq = 1;
            }
        }

        Ok(Self {
            mode,
            eval_mode,
            train_mode,
            rank,
            world_size,
            distributed,
            rng,
            output_dir,
            model,
            class_num,
            train_loader,
            unlabel_loader,
            eval_loader,
            gallery_loader,
            query_loader,
            train_loss,
            unlabel_loss,
            eval_loss,
            train_metrics,
            eval_metrics,
            optimizer,
            scheduler,
            amp,
            scaler,
            ema,
            xbm,
            checkpointer,
            preprocessor,
            postprocess,
            epochs,
            iter_per_epoch,
            start_eval_epoch: config.get_usize_or("Global.start_eval_epoch", 0)?,
            eval_interval: config.get_usize_or("Global.eval_interval", 1)?.max(1),
            eval_during_train: config.get_bool_or("Global.eval_during_train", true)?,
            save_interval: config.get_usize_or("Global.save_interval", 1)?.max(1),
            update_freq,
            best_metric: MetricInfo::default(),
            best_metric_ema: MetricInfo::default(),
            config,
        })
    }

    /// `class_num` belongs under `Arch`; a value left in `Global` is still
    /// honored with a migration warning, without mutating the config.
    fn resolve_class_num(config: &Config) -> Result<usize> {
        if let Some(n) = config.get_u64_opt("Arch.class_num")? {
            return Ok(n as usize);
        }
        if let Some(n) = config.get_u64_opt("Global.class_num")? {
            println!("warning: Global.class_num is deprecated, move it to Arch.class_num");
            return Ok(n as usize);
        }
        Err(Error::config(
            "Arch.class_num",
            "class_num must be configured",
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_eval_loaders(
        config: &Config,
        factory: &dyn DataLoaderFactory,
        eval_mode: EvalMode,
        seed: u64,
        eval_loader: &mut Option<Box<dyn DataLoader>>,
        gallery_loader: &mut Option<Box<dyn DataLoader>>,
        query_loader: &mut Option<Box<dyn DataLoader>>,
    ) -> Result<()> {
        match eval_mode {
            EvalMode::Classification | EvalMode::Adaface => {
                *eval_loader = Some(factory.build(config, "DataLoader.Eval", seed)?);
            }
            EvalMode::Retrieval => {
                if config.get("DataLoader.Gallery").is_some()
                    || config.get("DataLoader.Query").is_some()
                {
                    *gallery_loader = Some(factory.build(config, "DataLoader.Gallery", seed)?);
                    *query_loader = Some(factory.build(config, "DataLoader.Query", seed)?);
                } else {
                    // one Eval section serves as both gallery and query
                    *gallery_loader = Some(factory.build(config, "DataLoader.Eval", seed)?);
                    *query_loader = Some(factory.build(config, "DataLoader.Eval", seed)?);
                }
            }
        }
        Ok(())
    }

    /// Metrics that cannot survive a batch-transforming loader are dropped
    /// with a warning rather than reporting garbage.
    fn checked_metrics(
        config: &Config,
        section: &str,
        loader: Option<&dyn DataLoader>,
    ) -> Result<Vec<Box<dyn Metric>>> {
        let metrics = build_metrics(config, section)?;
        let Some(loader) = loader else {
            return Ok(metrics);
        };
        if !loader.applies_batch_transform() {
            return Ok(metrics);
        }
        let (kept, dropped): (Vec<_>, Vec<_>) = metrics
            .into_iter()
            .partition(|m| m.compatible_with_batch_transform());
        for m in &dropped {
            println!(
                "warning: metric {} is incompatible with a batch-transforming loader, dropping it",
                m.name()
            );
        }
        Ok(kept)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn eval_mode(&self) -> EvalMode {
        self.eval_mode
    }

    pub fn train_mode(&self) -> TrainMode {
        self.train_mode
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn class_num(&self) -> usize {
        self.class_num
    }

    pub fn best_metric(&self) -> MetricInfo {
        self.best_metric
    }

    /// The engine's seeded random state, for callers that extend the run
    /// with their own stochastic components.
    pub fn rng(&mut self) -> &mut RngState {
        &mut self.rng
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn amp(&self) -> Option<&AmpConfig> {
        self.amp.as_ref()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn require_mode(&self, expected: Mode, op: &str) -> Result<()> {
        if self.mode != expected {
            return Err(Error::config(
                "mode",
                format!("{op}() requires mode {expected:?}, engine was built for {:?}", self.mode),
            ));
        }
        Ok(())
    }
}
