//! The training loop
//!
//! One call to [`Engine::train`] runs the configured number of epochs,
//! interleaving evaluation, checkpointing and EMA bookkeeping. Evaluation
//! runs as a nested operation on the same engine; checkpoints go through
//! the injected [`Checkpointer`](crate::io::Checkpointer).

use super::{Engine, Mode, TrainMode};
use crate::arch::{ModelOutput, Param};
use crate::data::Batch;
use crate::io::{MetricInfo, Snapshot};
use crate::loss::functional::argmax_rows;
use crate::{Error, Result};
use ndarray::Array2;

/// Running average of a scalar stream.
pub(crate) struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub(crate) fn new() -> Self {
        Self { sum: 0.0, count: 0 }
    }

    pub(crate) fn update(&mut self, value: f32) {
        self.update_n(value, 1);
    }

    pub(crate) fn update_n(&mut self, value: f32, n: usize) {
        self.sum += f64::from(value) * n as f64;
        self.count += n;
    }

    pub(crate) fn avg(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

/// Gradient accumulator backing `Global.update_freq`: sums per-batch
/// gradients and releases their mean to the optimizer every `update_freq`
/// batches (and at epoch end, so no gradient is silently dropped).
struct GradAccum {
    grads: Vec<Array2<f32>>,
    pending: usize,
}

impl GradAccum {
    fn new() -> Self {
        Self {
            grads: Vec::new(),
            pending: 0,
        }
    }

    fn add(&mut self, params: &[&mut Param], scale: f32) {
        if self.grads.is_empty() {
            self.grads = params.iter().map(|p| &p.grad * scale).collect();
        } else {
            for (g, p) in self.grads.iter_mut().zip(params) {
                *g += &(&p.grad * scale);
            }
        }
        self.pending += 1;
    }

    fn flush_into(&mut self, params: &mut [&mut Param], unscale: f32) {
        let norm = unscale / self.pending as f32;
        for (p, g) in params.iter_mut().zip(&self.grads) {
            p.grad = g * norm;
        }
        self.grads.clear();
        self.pending = 0;
    }
}

impl Engine {
    /// Run the full training schedule: `epochs` epochs of optimization with
    /// periodic evaluation and checkpointing.
    ///
    /// When `Global.checkpoints` names a previously saved checkpoint, the
    /// run resumes after its recorded epoch, replaying the same per-epoch
    /// data order an uninterrupted run would have seen.
    pub fn train(&mut self) -> Result<()> {
        self.require_mode(Mode::Train, "train")?;
        let start_epoch = self.resume_if_configured()?;

        for epoch in start_epoch..=self.epochs {
            let lr = {
                let scheduler = self.scheduler.as_deref_mut().ok_or_else(|| {
                    Error::config("Optimizer", "train mode lost its schedule")
                })?;
                scheduler.lr_for_epoch(epoch)
            };
            if let Some(optimizer) = self.optimizer.as_deref_mut() {
                optimizer.set_lr(lr);
            }

            let avg_loss = match self.train_mode {
                TrainMode::Standard => self.train_epoch(epoch)?,
                TrainMode::CrossBatchMemory => self.train_epoch_xbm(epoch)?,
            };
            println!(
                "[train] epoch {epoch}/{}: lr {lr:.6}, loss {avg_loss:.6}",
                self.epochs
            );

            if self.should_eval(epoch) {
                let metric = self.eval()?;
                if let Some(scheduler) = self.scheduler.as_deref_mut() {
                    scheduler.step_metric(metric);
                }
                if metric > self.best_metric.metric {
                    self.best_metric = MetricInfo { metric, epoch };
                    self.save_checkpoint("best", epoch)?;
                    self.save_student_checkpoint(epoch)?;
                    println!("[eval] new best {metric:.5} at epoch {epoch}");
                }
                self.eval_ema(epoch)?;
            }

            if epoch % self.save_interval == 0 {
                self.save_checkpoint(&format!("epoch_{epoch}"), epoch)?;
            }
            self.save_checkpoint("latest", epoch)?;
        }
        Ok(())
    }

    fn resume_if_configured(&mut self) -> Result<usize> {
        let Some(prefix) = self.config.get_str_opt("Global.checkpoints")? else {
            return Ok(1);
        };
        match self.checkpointer.load(&self.output_dir, &prefix)? {
            Some(snapshot) => {
                snapshot.restore_into(self.model.as_mut())?;
                if let Some(ema) = self.ema.as_mut() {
                    ema.reset_from(self.model.as_ref());
                }
                self.best_metric = snapshot.metric_info;
                let resumed = snapshot.metric_info.epoch;
                println!(
                    "resumed `{prefix}`: epoch {resumed}, metric {:.5}",
                    snapshot.metric_info.metric
                );
                Ok(resumed + 1)
            }
            None => {
                println!(
                    "warning: checkpoint `{prefix}` not found in {}, starting fresh",
                    self.output_dir.display()
                );
                Ok(1)
            }
        }
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<f32> {
        if let Some(loader) = self.train_loader.as_deref_mut() {
            loader.set_epoch(epoch);
        }
        self.model.set_train(true);
        let mut meter = AverageMeter::new();
        let mut metric_acc: Vec<(String, AverageMeter)> = Vec::new();
        let mut accum = GradAccum::new();
        let mut steps = 0usize;

        while let Some(batch) = self.train_loader.as_deref_mut().and_then(|l| l.next_batch()) {
            let predicts = self.model.forward(&batch.inputs)?;
            let losses = self
                .train_loss
                .as_ref()
                .ok_or_else(|| Error::config("Loss.Train", "train mode lost its loss"))?
                .forward(&predicts, &batch)?;
            meter.update_n(losses.get("loss").unwrap_or(0.0), batch.len());

            if !self.train_metrics.is_empty() {
                let logits = predicts.primary()?;
                for metric in &self.train_metrics {
                    for (key, value) in metric.compute(logits, &batch.labels)? {
                        match metric_acc.iter_mut().find(|(k, _)| *k == key) {
                            Some((_, m)) => m.update_n(value, batch.len()),
                            None => {
                                let mut m = AverageMeter::new();
                                m.update_n(value, batch.len());
                                metric_acc.push((key, m));
                            }
                        }
                    }
                }
            }

            self.model.backward(&batch.inputs, &batch.labels)?;
            self.record_grads(&mut accum);
            self.maybe_step(&mut accum, false)?;
            steps += 1;
            if self.iter_per_epoch.map_or(false, |n| steps >= n) {
                break;
            }
        }
        self.train_unlabeled(epoch, &mut accum)?;
        self.maybe_step(&mut accum, true)?;
        for (key, m) in &metric_acc {
            println!("[train] epoch {epoch}: {key} {:.5}", m.avg());
        }
        Ok(meter.avg())
    }

    /// Self-training pass over the unlabeled loader, when one is
    /// configured: the model's own argmax predictions serve as
    /// pseudo-labels for an extra round of updates, metered by the
    /// unlabeled loss if present.
    fn train_unlabeled(&mut self, epoch: usize, accum: &mut GradAccum) -> Result<()> {
        let Some(mut loader) = self.unlabel_loader.take() else {
            return Ok(());
        };
        loader.set_epoch(epoch);
        let mut meter = AverageMeter::new();
        let mut run = || -> Result<()> {
            while let Some(batch) = loader.next_batch() {
                let predicts = self.model.forward(&batch.inputs)?;
                let pseudo = argmax_rows(predicts.primary()?);
                let pseudo_batch = Batch {
                    inputs: batch.inputs,
                    labels: pseudo,
                };
                if let Some(loss) = &self.unlabel_loss {
                    let losses = loss.forward(&predicts, &pseudo_batch)?;
                    meter.update_n(losses.get("loss").unwrap_or(0.0), pseudo_batch.len());
                }
                self.model.backward(&pseudo_batch.inputs, &pseudo_batch.labels)?;
                self.record_grads(accum);
                self.maybe_step(accum, false)?;
            }
            Ok(())
        };
        let outcome = run();
        self.unlabel_loader = Some(loader);
        outcome?;
        if self.unlabel_loss.is_some() {
            println!("[train] epoch {epoch}: unlabeled loss {:.6}", meter.avg());
        }
        Ok(())
    }

    /// Like [`train_epoch`](Self::train_epoch), but every step extends the
    /// current batch's features with the resident cross-batch memory before
    /// the loss sees them, so pair-based losses mine far more pairs than a
    /// single batch holds.
    fn train_epoch_xbm(&mut self, epoch: usize) -> Result<f32> {
        if let Some(loader) = self.train_loader.as_deref_mut() {
            loader.set_epoch(epoch);
        }
        self.model.set_train(true);
        let mut meter = AverageMeter::new();
        let mut accum = GradAccum::new();
        let mut steps = 0usize;

        while let Some(batch) = self.train_loader.as_deref_mut().and_then(|l| l.next_batch()) {
            let predicts = self.model.forward(&batch.inputs)?;
            let feats = predicts.primary()?;
            let (ext_feats, ext_labels) = {
                let memory = self.xbm.as_mut().ok_or_else(|| {
                    Error::config("Global.train_mode", "xbm training lost its memory bank")
                })?;
                memory.enqueue_dequeue(feats.view(), batch.labels.view())?;
                let (mem_feats, mem_labels) = memory.get();
                (mem_feats.to_owned(), mem_labels.to_owned())
            };

            let ext_predicts = ModelOutput::Tensor(ext_feats.clone());
            let ext_batch = Batch {
                inputs: ext_feats,
                labels: ext_labels,
            };
            let losses = self
                .train_loss
                .as_ref()
                .ok_or_else(|| Error::config("Loss.Train", "train mode lost its loss"))?
                .forward(&ext_predicts, &ext_batch)?;
            meter.update_n(losses.get("loss").unwrap_or(0.0), batch.len());

            self.model.backward(&batch.inputs, &batch.labels)?;
            self.record_grads(&mut accum);
            self.maybe_step(&mut accum, false)?;
            steps += 1;
            if self.iter_per_epoch.map_or(false, |n| steps >= n) {
                break;
            }
        }
        self.maybe_step(&mut accum, true)?;
        Ok(meter.avg())
    }

    fn record_grads(&mut self, accum: &mut GradAccum) {
        let scale = self.scaler.as_ref().map_or(1.0, |s| s.scale());
        let params = self.model.parameters_mut();
        accum.add(&params, scale);
    }

    fn maybe_step(&mut self, accum: &mut GradAccum, at_epoch_end: bool) -> Result<()> {
        if accum.pending == 0 || (accum.pending < self.update_freq && !at_epoch_end) {
            return Ok(());
        }
        let scale = self.scaler.as_ref().map_or(1.0, |s| s.scale());
        let optimizer = self
            .optimizer
            .as_deref_mut()
            .ok_or_else(|| Error::config("Optimizer", "train mode lost its optimizer"))?;
        let mut params = self.model.parameters_mut();
        accum.flush_into(&mut params, 1.0 / scale);
        optimizer.step(&mut params)?;
        optimizer.zero_grad(&mut params);
        drop(params);

        if let Some(ema) = self.ema.as_mut() {
            ema.update(self.model.as_ref())?;
        }
        Ok(())
    }

    /// Swap in the EMA shadow, evaluate it, track its own best checkpoint,
    /// and swap the live weights back regardless of the outcome.
    fn eval_ema(&mut self, epoch: usize) -> Result<()> {
        let Some(mut ema) = self.ema.take() else {
            return Ok(());
        };
        ema.swap(self.model.as_mut())?;
        let outcome = self.eval_ema_swapped(epoch);
        let restore = ema.swap(self.model.as_mut());
        self.ema = Some(ema);
        outcome?;
        restore
    }

    fn eval_ema_swapped(&mut self, epoch: usize) -> Result<()> {
        let metric = self.eval()?;
        println!("[eval][ema] epoch {epoch}: {metric:.5}");
        if metric > self.best_metric_ema.metric {
            self.best_metric_ema = MetricInfo { metric, epoch };
            let snapshot = Snapshot::from_model(self.model.as_ref(), self.best_metric_ema);
            self.checkpointer
                .save(&self.output_dir, "best_ema", &snapshot)?;
        }
        Ok(())
    }

    fn should_eval(&self, epoch: usize) -> bool {
        let has_loader = self.eval_loader.is_some()
            || (self.gallery_loader.is_some() && self.query_loader.is_some());
        self.eval_during_train
            && has_loader
            && epoch >= self.start_eval_epoch
            && epoch % self.eval_interval == 0
    }

    /// Distillation runs persist the student alone next to the best
    /// ensemble checkpoint, so the distilled weights serve directly in a
    /// bare classifier without re-running export.
    fn save_student_checkpoint(&self, epoch: usize) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let Some(student) = self.model.sub_model("Student") else {
            return Ok(());
        };
        let info = MetricInfo {
            metric: self.best_metric.metric,
            epoch,
        };
        let snapshot = Snapshot::from_model(student, info);
        self.checkpointer
            .save(&self.output_dir, "best_student", &snapshot)
    }

    /// Only rank 0 writes; other ranks hold identical weights.
    fn save_checkpoint(&self, prefix: &str, epoch: usize) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let info = MetricInfo {
            metric: self.best_metric.metric,
            epoch,
        };
        let mut snapshot = Snapshot::from_model(self.model.as_ref(), info);
        if let Some(ema) = &self.ema {
            snapshot = snapshot.with_ema(ema.shadow_weights());
        }
        self.checkpointer.save(&self.output_dir, prefix, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineBuilder, Mode};
    use approx::assert_relative_eq;

    fn train_config(out_dir: &str, extra: &str) -> Config {
        Config::from_yaml_str(&format!(
            "Global:\n  epochs: 5\n  seed: 11\n  output_dir: {out_dir}\nArch:\n  name: LinearClassifier\n  class_num: 4\n  feat_dim: 8\nOptimizer:\n  name: Momentum\n  lr: 0.3\n  momentum: 0.9\nLoss:\n  Train:\n    - CELoss:\n        weight: 1.0\nMetric:\n  Eval:\n    - TopkAcc:\n        topk: [1]\nDataLoader:\n  Train:\n    num_samples: 64\n    feat_dim: 8\n    class_num: 4\n    batch_size: 16\n  Eval:\n    num_samples: 32\n    feat_dim: 8\n    class_num: 4\n    batch_size: 16\n    shuffle: false\n{extra}"
        ))
        .unwrap()
    }

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        assert_relative_eq!(meter.avg(), 0.0);
        meter.update(2.0);
        meter.update_n(4.0, 3);
        assert_relative_eq!(meter.avg(), 3.5, epsilon = 1e-6);
    }

    #[test]
    fn test_training_improves_on_separable_data() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(&dir.path().display().to_string(), "");
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
        // synthetic clusters are linearly separable; top1 must beat chance
        assert!(engine.best_metric().metric > 0.5);
    }

    #[test]
    fn test_checkpoints_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(&dir.path().display().to_string(), "");
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
        assert!(dir.path().join("latest.json").is_file());
        assert!(dir.path().join("best.json").is_file());
        assert!(dir.path().join("epoch_5.json").is_file());
    }

    #[test]
    fn test_update_freq_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = train_config(&dir.path().display().to_string(), "");
        config.apply_overrides(&["Global.update_freq=2"]).unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        // accumulation must not break convergence, only coarsen stepping
        engine.train().unwrap();
        assert!(engine.best_metric().metric > 0.5);
    }

    #[test]
    fn test_ema_checkpoint_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(
            &dir.path().display().to_string(),
            "EMA:\n  decay: 0.9\n",
        );
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
        assert!(dir.path().join("best_ema.json").is_file());
    }

    #[test]
    fn test_xbm_training_runs() {
        let dir = tempfile::tempdir().unwrap();
        // logits are the features here, so the bank width is class_num
        let config = Config::from_yaml_str(&format!(
            "Global:\n  epochs: 2\n  seed: 11\n  output_dir: {}\n  train_mode: xbm\n  xbm_size: 48\n  eval_during_train: false\nArch:\n  name: LinearClassifier\n  class_num: 4\n  feat_dim: 8\nOptimizer:\n  name: Momentum\n  lr: 0.1\n  momentum: 0.9\nLoss:\n  Train:\n    - ContrastiveLoss:\n        margin: 0.5\n        feat_dim: 4\nDataLoader:\n  Train:\n    num_samples: 64\n    feat_dim: 8\n    class_num: 4\n    batch_size: 16\n",
            dir.path().display()
        ))
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
    }

    #[test]
    fn test_unlabeled_pass_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_yaml_str(&format!(
            "Global:\n  epochs: 3\n  seed: 11\n  output_dir: {}\n  eval_during_train: false\nArch:\n  name: LinearClassifier\n  class_num: 4\n  feat_dim: 8\nOptimizer:\n  name: Momentum\n  lr: 0.1\n  momentum: 0.9\nLoss:\n  Train:\n    - CELoss:\n  UnLabelTrain:\n    - CELoss:\n        weight: 0.5\nDataLoader:\n  Train:\n    num_samples: 32\n    feat_dim: 8\n    class_num: 4\n    batch_size: 8\n  UnLabelTrain:\n    num_samples: 16\n    feat_dim: 8\n    class_num: 4\n    batch_size: 8\n",
            dir.path().display()
        ))
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
        assert!(dir.path().join("latest.json").is_file());
    }

    #[test]
    fn test_iter_per_epoch_caps_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = train_config(&dir.path().display().to_string(), "");
        config
            .apply_overrides(&["Global.iter_per_epoch=1", "Global.eval_during_train=false"])
            .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        // one step per epoch still completes the schedule and checkpoints
        engine.train().unwrap();
        assert!(dir.path().join("latest.json").is_file());
    }

    #[test]
    fn test_resume_continues_from_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().display().to_string();
        let config = train_config(&out, "");
        let mut engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        engine.train().unwrap();
        let first_best = engine.best_metric();

        let mut config = train_config(&out, "");
        config
            .apply_overrides(&["Global.checkpoints=latest", "Global.epochs=7"])
            .unwrap();
        let mut resumed = EngineBuilder::new(config, Mode::Train).build().unwrap();
        resumed.train().unwrap();
        // resumed run keeps the earlier best rather than starting over
        assert!(resumed.best_metric().metric >= first_best.metric);
    }

    #[test]
    fn test_train_rejected_in_eval_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = train_config(&dir.path().display().to_string(), "");
        let mut engine = EngineBuilder::new(config, Mode::Eval).build().unwrap();
        assert!(engine.train().is_err());
    }
}
