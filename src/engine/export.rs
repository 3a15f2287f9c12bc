//! Inference export
//!
//! `export` prepares the trained model for serving: structural
//! re-parameterization, sub-model selection for ensembles, a fixed output
//! key and a final activation, then persists the weights under the
//! `inference` checkpoint name. The returned [`ExportedModel`] is the
//! in-process serving adapter over the same prepared model.

use super::{Engine, Mode};
use crate::arch::{Model, ModelOutput};
use crate::io::Snapshot;
use crate::loss::functional::softmax;
use crate::{Error, Result};
use ndarray::Array2;
use std::path::PathBuf;

/// Final activation applied to the exported output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Softmax,
    /// Per-class probabilities for multilabel heads
    Sigmoid,
    Identity,
}

/// Serving adapter: one tensor in, one activated tensor out.
pub struct ExportedModel {
    model: Box<dyn Model>,
    model_name: Option<String>,
    output_key: Option<String>,
    activation: Activation,
}

impl ExportedModel {
    pub fn forward(&self, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        let out = self.model.forward(inputs)?;
        let tensor = self.select(&out)?;
        Ok(match self.activation {
            Activation::Softmax => softmax(tensor),
            Activation::Sigmoid => tensor.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Identity => tensor.clone(),
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn select<'a>(&self, out: &'a ModelOutput) -> Result<&'a Array2<f32>> {
        let node = match &self.model_name {
            Some(name) => out.get(name)?,
            None => out,
        };
        match &self.output_key {
            Some(key) => node.get(key)?.as_tensor(),
            None => node.primary(),
        }
    }
}

impl Engine {
    /// Export the model for inference, consuming the engine.
    ///
    /// Weights are saved under the `inference` checkpoint name in
    /// `Global.save_inference_dir` (the output directory when unset).
    pub fn export(mut self) -> Result<ExportedModel> {
        self.require_mode(Mode::Export, "export")?;

        let model_name = self.config.get_str_opt("Arch.infer_model_name")?;
        if let Some(name) = &model_name {
            let subs = self.model.sub_model_names();
            if !subs.iter().any(|n| n == name) {
                return Err(Error::config(
                    "Arch.infer_model_name",
                    format!("no sub-model named `{name}`"),
                ));
            }
        }
        let output_key = self.config.get_str_opt("Arch.infer_output_key")?;
        let activation = if self.config.get_bool_or("Arch.use_multilabel", false)? {
            Activation::Sigmoid
        } else if self.config.get_bool_or("Arch.infer_add_softmax", true)? {
            Activation::Softmax
        } else {
            Activation::Identity
        };

        self.model.set_train(false);
        self.model.reparameterize();

        let save_dir = match self.config.get_str_opt("Global.save_inference_dir")? {
            Some(dir) => PathBuf::from(dir),
            None => self.output_dir.clone(),
        };
        if self.rank == 0 {
            let snapshot = Snapshot::from_model(self.model.as_ref(), self.best_metric);
            self.checkpointer.save(&save_dir, "inference", &snapshot)?;
            println!("exported inference model to {}", save_dir.display());
        }

        Ok(ExportedModel {
            model: self.model,
            model_name,
            output_key,
            activation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineBuilder, Mode};
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn export_config(out_dir: &str, arch_extra: &str) -> Config {
        Config::from_yaml_str(&format!(
            "Global:\n  epochs: 1\n  seed: 2\n  output_dir: {out_dir}\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 4\n{arch_extra}"
        ))
        .unwrap()
    }

    #[test]
    fn test_export_writes_inference_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = export_config(&dir.path().display().to_string(), "");
        let engine = EngineBuilder::new(config, Mode::Export).build().unwrap();
        engine.export().unwrap();
        assert!(dir.path().join("inference.json").is_file());
    }

    #[test]
    fn test_softmax_output_rows_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let config = export_config(&dir.path().display().to_string(), "");
        let exported = EngineBuilder::new(config, Mode::Export)
            .build()
            .unwrap()
            .export()
            .unwrap();
        let probs = exported.forward(&Array2::from_elem((2, 4), 0.3)).unwrap();
        for row in probs.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_multilabel_uses_sigmoid() {
        let dir = tempfile::tempdir().unwrap();
        let config = export_config(
            &dir.path().display().to_string(),
            "  use_multilabel: true\n",
        );
        let exported = EngineBuilder::new(config, Mode::Export)
            .build()
            .unwrap()
            .export()
            .unwrap();
        assert_eq!(exported.activation(), Activation::Sigmoid);
        let probs = exported.forward(&Array2::zeros((1, 4))).unwrap();
        for &v in probs.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_ensemble_sub_model_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = export_config(
            &dir.path().display().to_string(),
            "  infer_model_name: Student\n",
        );
        config
            .apply_overrides(&["Arch.name=DistillationModel"])
            .unwrap();
        let exported = EngineBuilder::new(config, Mode::Export)
            .build()
            .unwrap()
            .export()
            .unwrap();
        let probs = exported.forward(&Array2::zeros((1, 4))).unwrap();
        assert_eq!(probs.ncols(), 3);
    }

    #[test]
    fn test_unknown_sub_model_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = export_config(
            &dir.path().display().to_string(),
            "  infer_model_name: Backbone\n",
        );
        let engine = EngineBuilder::new(config, Mode::Export).build().unwrap();
        assert!(engine.export().is_err());
    }

    #[test]
    fn test_export_rejected_in_train_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_yaml_str(&format!(
            "Global:\n  epochs: 1\n  output_dir: {}\n  eval_during_train: false\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 4\nOptimizer:\n  name: Momentum\n  lr: 0.1\nLoss:\n  Train:\n    - CELoss:\nDataLoader:\n  Train:\n    num_samples: 8\n    feat_dim: 4\n    class_num: 3\n    batch_size: 4\n",
            dir.path().display()
        ))
        .unwrap();
        let engine = EngineBuilder::new(config, Mode::Train).build().unwrap();
        assert!(engine.export().is_err());
    }
}
