//! Batch inference
//!
//! `infer` reads the configured input list, shards it across ranks, runs
//! the model batch by batch and post-processes each probability row into a
//! top-k prediction. Input loading goes through the [`Preprocessor`] seam
//! so tests and embedders can feed arbitrary feature sources.

use super::{Engine, Mode};
use crate::data::{get_image_list, Prediction};
use crate::loss::functional::softmax;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::path::Path;

/// Turns one input path into a feature vector.
pub trait Preprocessor {
    fn load(&self, path: &Path) -> Result<Array1<f32>>;
}

/// Reads whitespace-separated numbers from a text file, one file per
/// sample.
#[derive(Debug, Default, Clone)]
pub struct NumericFilePreprocessor;

impl Preprocessor for NumericFilePreprocessor {
    fn load(&self, path: &Path) -> Result<Array1<f32>> {
        if !path.is_file() {
            return Err(Error::ResourceMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let values = text
            .split_whitespace()
            .map(|token| {
                token.parse::<f32>().map_err(|e| {
                    Error::config(
                        "Infer.infer_imgs",
                        format!("{}: `{token}`: {e}", path.display()),
                    )
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        if values.is_empty() {
            return Err(Error::DegenerateBatch(format!(
                "{} holds no feature values",
                path.display()
            )));
        }
        Ok(Array1::from_vec(values))
    }
}

impl Engine {
    /// Run inference over `Infer.infer_imgs` (a file list or directory).
    ///
    /// Inputs are sharded round-robin across ranks; within its shard each
    /// rank preserves the list order, so rank-0 single-process output is
    /// identical to the unsharded run.
    pub fn infer(&mut self) -> Result<Vec<(String, Prediction)>> {
        self.require_mode(Mode::Infer, "infer")?;
        let source = self
            .config
            .get_str_opt("Infer.infer_imgs")?
            .ok_or_else(|| Error::config("Infer.infer_imgs", "no inference input configured"))?;
        let list = get_image_list(Path::new(&source))?;
        let shard: Vec<String> = list
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size.max(1))
            .collect();
        let batch_size = self.config.get_usize_or("Infer.batch_size", 16)?.max(1);
        let postprocess = self
            .postprocess
            .as_ref()
            .ok_or_else(|| Error::config("Infer.PostProcess", "infer mode lost its postprocess"))?;

        self.model.set_train(false);
        let mut results = Vec::with_capacity(shard.len());
        for chunk in shard.chunks(batch_size) {
            let inputs = Self::load_batch(self.preprocessor.as_ref(), chunk)?;
            let predicts = self.model.forward(&inputs)?;
            let probs = softmax(predicts.primary()?);
            for (path, row) in chunk.iter().zip(probs.rows()) {
                let prediction = postprocess.process(row);
                println!(
                    "[infer] {path}: classes {:?} scores {:?}",
                    prediction.class_ids, prediction.scores
                );
                results.push((path.clone(), prediction));
            }
        }
        Ok(results)
    }

    fn load_batch(preprocessor: &dyn Preprocessor, paths: &[String]) -> Result<Array2<f32>> {
        let mut rows: Vec<f32> = Vec::new();
        let mut dim = None;
        for path in paths {
            let features = preprocessor.load(Path::new(path))?;
            match dim {
                None => dim = Some(features.len()),
                Some(d) if d != features.len() => {
                    return Err(Error::DegenerateBatch(format!(
                        "{path} has {} features, expected {d}",
                        features.len()
                    )))
                }
                Some(_) => {}
            }
            rows.extend(features.iter().copied());
        }
        let dim = dim.ok_or_else(|| Error::DegenerateBatch("empty inference batch".to_string()))?;
        Array2::from_shape_vec((paths.len(), dim), rows)
            .map_err(|e| Error::DegenerateBatch(format!("inference batch: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineBuilder, Mode};
    use std::io::Write;

    fn write_sample(dir: &Path, name: &str, values: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        writeln!(f, "{values}").unwrap();
    }

    fn infer_config(input_dir: &Path, extra: &str) -> Config {
        Config::from_yaml_str(&format!(
            "Global:\n  epochs: 1\n  seed: 5\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 4\nInfer:\n  infer_imgs: {}\n  batch_size: 2\n{extra}",
            input_dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_numeric_preprocessor() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a.txt", "0.5 1.0 -2.0");
        let features = NumericFilePreprocessor
            .load(&dir.path().join("a.txt"))
            .unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[2], -2.0);
    }

    #[test]
    fn test_infer_over_directory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            write_sample(dir.path(), name, "1.0 0.0 0.0 0.0");
        }
        let config = infer_config(dir.path(), "  PostProcess:\n    topk: 2\n");
        let mut engine = EngineBuilder::new(config, Mode::Infer).build().unwrap();
        let results = engine.infer().unwrap();
        assert_eq!(results.len(), 3);
        // directory listing is sorted, order preserved
        assert!(results[0].0.ends_with("a.txt"));
        assert!(results[2].0.ends_with("c.txt"));
        for (_, prediction) in &results {
            assert_eq!(prediction.class_ids.len(), 2);
        }
    }

    #[test]
    fn test_infer_shards_by_rank() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            write_sample(dir.path(), name, "1.0 0.0 0.0 0.0");
        }
        let config = infer_config(dir.path(), "");
        let mut engine = EngineBuilder::new(config, Mode::Infer)
            .rank(1)
            .world_size(2)
            .build()
            .unwrap();
        let results = engine.infer().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].0.ends_with("b.txt"));
        assert!(results[1].0.ends_with("d.txt"));
    }

    #[test]
    fn test_missing_input_is_resource_missing() {
        let config = Config::from_yaml_str(
            "Global:\n  epochs: 1\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 4\nInfer:\n  infer_imgs: /no/such/list.txt\n",
        )
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Infer).build().unwrap();
        assert!(matches!(
            engine.infer().unwrap_err(),
            Error::ResourceMissing(_)
        ));
    }

    #[test]
    fn test_mismatched_feature_width_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a.txt", "1.0 0.0 0.0 0.0");
        write_sample(dir.path(), "b.txt", "1.0 0.0");
        let config = infer_config(dir.path(), "");
        let mut engine = EngineBuilder::new(config, Mode::Infer).build().unwrap();
        assert!(engine.infer().is_err());
    }
}
