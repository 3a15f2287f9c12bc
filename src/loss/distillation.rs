//! Distillation loss adapters
//!
//! Each adapter lifts a base pointwise loss over the named multi-model
//! output mapping: it selects sub-model output pairs (or single models
//! against ground truth), optionally indexes a specific output key,
//! delegates to the base loss and re-keys every returned term with a
//! composite name encoding the participants. Re-keyed dictionaries merge
//! loudly: a collision is a configuration defect, not an overwrite.

use super::at::ATLoss;
use super::cross_entropy::{CELoss, TargetRef};
use super::dict::LossDict;
use super::distance::DistanceLoss;
use super::dml::DMLLoss;
use super::functional::{argmax_rows, kl_div_sum, log_softmax, softmax};
use super::kldiv::KLDivLoss;
use super::rkd::{RkdAngle, RkdDistance};
use super::Loss;
use crate::arch::ModelOutput;
use crate::data::Batch;
use crate::{Error, Result};
use ndarray::Array2;

/// An ordered (model_a, model_b) pair selection.
pub type ModelNamePairs = Vec<(String, String)>;

fn require_pairs(pairs: &ModelNamePairs, who: &str) -> Result<()> {
    if pairs.is_empty() {
        return Err(Error::config(who, "model_name_pairs must not be empty"));
    }
    Ok(())
}

fn pair_tensors<'a>(
    predicts: &'a ModelOutput,
    pair: &(String, String),
    key: Option<&str>,
) -> Result<(&'a Array2<f32>, &'a Array2<f32>)> {
    let a = predicts.get(&pair.0)?.tensor_at(key)?;
    let b = predicts.get(&pair.1)?.tensor_at(key)?;
    Ok((a, b))
}

/// Soft cross-entropy between sub-model output pairs; terms re-key to
/// `{k}_{a}_{b}`.
pub struct DistillationCELoss {
    base: CELoss,
    pairs: ModelNamePairs,
    key: Option<String>,
}

impl DistillationCELoss {
    pub fn new(base: CELoss, pairs: ModelNamePairs, key: Option<String>) -> Result<Self> {
        require_pairs(&pairs, "DistillationCELoss")?;
        Ok(Self { base, pairs, key })
    }
}

impl Loss for DistillationCELoss {
    fn name(&self) -> &str {
        "DistillationCELoss"
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for pair in &self.pairs {
            let (a, b) = pair_tensors(predicts, pair, self.key.as_deref())?;
            let loss = self.base.compute(a, TargetRef::Soft(b))?;
            for (k, v) in loss.iter() {
                out.insert(format!("{k}_{}_{}", pair.0, pair.1), v)?;
            }
        }
        Ok(out)
    }
}

/// Hard cross-entropy of named sub-models against ground truth; terms
/// re-key to `{k}_{name}` or `{k}_{name}_{key}`.
pub struct DistillationGTCELoss {
    base: CELoss,
    model_names: Vec<String>,
    key: Option<String>,
}

impl DistillationGTCELoss {
    pub fn new(base: CELoss, model_names: Vec<String>, key: Option<String>) -> Result<Self> {
        if model_names.is_empty() {
            return Err(Error::config(
                "DistillationGTCELoss",
                "model_names must not be empty",
            ));
        }
        Ok(Self {
            base,
            model_names,
            key,
        })
    }
}

impl Loss for DistillationGTCELoss {
    fn name(&self) -> &str {
        "DistillationGTCELoss"
    }

    fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for name in &self.model_names {
            let logits = predicts.get(name)?.tensor_at(self.key.as_deref())?;
            let loss = self.base.compute(logits, TargetRef::Hard(&batch.labels))?;
            for (k, v) in loss.iter() {
                match &self.key {
                    Some(key) => out.insert(format!("{k}_{name}_{key}"), v)?,
                    None => out.insert(format!("{k}_{name}"), v)?,
                }
            }
        }
        Ok(out)
    }
}

/// Mutual-learning loss over pairs; terms re-key to `{k}_{a}_{b}_{idx}`.
pub struct DistillationDMLLoss {
    base: DMLLoss,
    pairs: ModelNamePairs,
    key: Option<String>,
}

impl DistillationDMLLoss {
    pub fn new(base: DMLLoss, pairs: ModelNamePairs, key: Option<String>) -> Result<Self> {
        require_pairs(&pairs, "DistillationDMLLoss")?;
        Ok(Self { base, pairs, key })
    }
}

impl Loss for DistillationDMLLoss {
    fn name(&self) -> &str {
        "DistillationDMLLoss"
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for (idx, pair) in self.pairs.iter().enumerate() {
            let (a, b) = pair_tensors(predicts, pair, self.key.as_deref())?;
            let loss = self.base.compute(a, b)?;
            for (k, v) in loss.iter() {
                out.insert(format!("{k}_{}_{}_{idx}", pair.0, pair.1), v)?;
            }
        }
        Ok(out)
    }
}

/// Feature-distance loss over pairs; terms re-key to `{name}_{k}_{idx}`.
pub struct DistillationDistanceLoss {
    base: DistanceLoss,
    name: String,
    pairs: ModelNamePairs,
    key: Option<String>,
}

impl DistillationDistanceLoss {
    pub fn new(
        base: DistanceLoss,
        name: impl Into<String>,
        pairs: ModelNamePairs,
        key: Option<String>,
    ) -> Result<Self> {
        require_pairs(&pairs, "DistillationDistanceLoss")?;
        Ok(Self {
            base,
            name: name.into(),
            pairs,
            key,
        })
    }
}

impl Loss for DistillationDistanceLoss {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for (idx, pair) in self.pairs.iter().enumerate() {
            let (a, b) = pair_tensors(predicts, pair, self.key.as_deref())?;
            let loss = self.base.compute(a, b)?;
            for (k, v) in loss.iter() {
                out.insert(format!("{}_{k}_{idx}", self.name), v)?;
            }
        }
        Ok(out)
    }
}

/// Relational distillation over matched output-key lists; emits
/// `loss_angle_{idx}_{a}_{b}` and `loss_dist_{idx}_{a}_{b}` per key pair.
pub struct DistillationRKDLoss {
    pairs: ModelNamePairs,
    student_keepkeys: Vec<String>,
    teacher_keepkeys: Vec<String>,
    angle: RkdAngle,
    dist: RkdDistance,
}

impl DistillationRKDLoss {
    pub fn new(
        pairs: ModelNamePairs,
        student_keepkeys: Vec<String>,
        teacher_keepkeys: Vec<String>,
    ) -> Result<Self> {
        require_pairs(&pairs, "DistillationRKDLoss")?;
        if student_keepkeys.len() != teacher_keepkeys.len() || student_keepkeys.is_empty() {
            return Err(Error::config(
                "DistillationRKDLoss",
                format!(
                    "student_keepkeys ({}) and teacher_keepkeys ({}) must be equally long and non-empty",
                    student_keepkeys.len(),
                    teacher_keepkeys.len()
                ),
            ));
        }
        Ok(Self {
            pairs,
            student_keepkeys,
            teacher_keepkeys,
            angle: RkdAngle,
            dist: RkdDistance,
        })
    }
}

impl Loss for DistillationRKDLoss {
    fn name(&self) -> &str {
        "DistillationRKDLoss"
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for (m1, m2) in &self.pairs {
            for (idx, (sk, tk)) in self
                .student_keepkeys
                .iter()
                .zip(&self.teacher_keepkeys)
                .enumerate()
            {
                let s = predicts.get(m1)?.tensor_at(Some(sk))?;
                let t = predicts.get(m2)?.tensor_at(Some(tk))?;
                out.insert(format!("loss_angle_{idx}_{m1}_{m2}"), self.angle.compute(s, t)?)?;
                out.insert(format!("loss_dist_{idx}_{m1}_{m2}"), self.dist.compute(s, t)?)?;
            }
        }
        Ok(out)
    }
}

/// Key selection for the KL adapter: compare two models at one (optional)
/// key, or two keys within a single model's output.
pub enum KLDivKeySelect {
    /// Pairwise across models, optionally indexed by one key
    Pairwise(Option<String>),
    /// Two output keys of the first model of each pair
    Attention(String, String),
}

/// Temperature-scaled KL over pairs; terms re-key to `{k}_{a}_{b}`, or
/// `{k}_{key0}_{key1}` in attention mode.
pub struct DistillationKLDivLoss {
    base: KLDivLoss,
    pairs: ModelNamePairs,
    select: KLDivKeySelect,
}

impl DistillationKLDivLoss {
    pub fn new(base: KLDivLoss, pairs: ModelNamePairs, select: KLDivKeySelect) -> Result<Self> {
        require_pairs(&pairs, "DistillationKLDivLoss")?;
        Ok(Self { base, pairs, select })
    }
}

impl Loss for DistillationKLDivLoss {
    fn name(&self) -> &str {
        "DistillationKLDivLoss"
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        match &self.select {
            KLDivKeySelect::Attention(k0, k1) => {
                for pair in &self.pairs {
                    let model = predicts.get(&pair.0)?;
                    let a = model.tensor_at(Some(k0))?;
                    let b = model.tensor_at(Some(k1))?;
                    let loss = self.base.compute(a, b)?;
                    for (k, v) in loss.iter() {
                        out.insert(format!("{k}_{k0}_{k1}"), v)?;
                    }
                }
            }
            KLDivKeySelect::Pairwise(key) => {
                for pair in &self.pairs {
                    let (a, b) = pair_tensors(predicts, pair, key.as_deref())?;
                    let loss = self.base.compute(a, b)?;
                    for (k, v) in loss.iter() {
                        out.insert(format!("{k}_{}_{}", pair.0, pair.1), v)?;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Attention-transfer over matched activation key lists; terms re-key to
/// `{k}_{a}_{b}` (pairwise) or keep the base key (attention mode).
pub struct DistillationATLoss {
    base: ATLoss,
    pairs: ModelNamePairs,
    student_keys: Vec<String>,
    teacher_keys: Vec<String>,
    attention_mode: bool,
}

impl DistillationATLoss {
    pub fn new(
        base: ATLoss,
        pairs: ModelNamePairs,
        student_keys: Vec<String>,
        teacher_keys: Vec<String>,
        attention_mode: bool,
    ) -> Result<Self> {
        require_pairs(&pairs, "DistillationATLoss")?;
        if student_keys.is_empty() || student_keys.len() != teacher_keys.len() {
            return Err(Error::config(
                "DistillationATLoss",
                "student_keys and teacher_keys must be equally long and non-empty",
            ));
        }
        Ok(Self {
            base,
            pairs,
            student_keys,
            teacher_keys,
            attention_mode,
        })
    }

    fn collect<'a>(&self, model: &'a ModelOutput, keys: &[String]) -> Result<Vec<&'a Array2<f32>>> {
        keys.iter().map(|k| model.tensor_at(Some(k))).collect()
    }
}

impl Loss for DistillationATLoss {
    fn name(&self) -> &str {
        "DistillationATLoss"
    }

    fn forward(&self, predicts: &ModelOutput, _batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        for pair in &self.pairs {
            if self.attention_mode {
                let model = predicts.get(&pair.0)?;
                let s = self.collect(model, &self.student_keys)?;
                let t = self.collect(model, &self.teacher_keys)?;
                out.merge(self.base.compute(&s, &t)?)?;
            } else {
                let s = self.collect(predicts.get(&pair.0)?, &self.student_keys)?;
                let t = self.collect(predicts.get(&pair.1)?, &self.teacher_keys)?;
                let loss = self.base.compute(&s, &t)?;
                for (k, v) in loss.iter() {
                    out.insert(format!("{k}_{}_{}", pair.0, pair.1), v)?;
                }
            }
        }
        Ok(out)
    }
}

/// Guided KL: distill only over samples the teacher classifies correctly.
///
/// The agreement mask comes from comparing the teacher argmax with the
/// ground-truth labels; masked-out rows contribute nothing. A batch with
/// zero agreeing samples contributes a zero loss term rather than a
/// division by zero.
pub struct DistillationGuidedKLDivLoss {
    pairs: ModelNamePairs,
    temperature: f32,
    key: Option<String>,
}

impl DistillationGuidedKLDivLoss {
    pub fn new(pairs: ModelNamePairs, temperature: f32, key: Option<String>) -> Result<Self> {
        require_pairs(&pairs, "DistillationGuidedKLDivLoss")?;
        if temperature <= 0.0 {
            return Err(Error::config(
                "DistillationGuidedKLDivLoss.temperature",
                format!("temperature {temperature} must be positive"),
            ));
        }
        Ok(Self {
            pairs,
            temperature,
            key,
        })
    }
}

impl Loss for DistillationGuidedKLDivLoss {
    fn name(&self) -> &str {
        "DistillationGuidedKLDivLoss"
    }

    fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        let t = self.temperature;
        for pair in &self.pairs {
            let (student, teacher) = pair_tensors(predicts, pair, self.key.as_deref())?;
            if student.nrows() != batch.labels.len() {
                return Err(Error::DegenerateBatch(format!(
                    "{} predictions but {} labels",
                    student.nrows(),
                    batch.labels.len()
                )));
            }
            let log_s = log_softmax(&(student / t));
            let soft_t = softmax(&(teacher / t));
            let t_argmax = argmax_rows(&soft_t);

            let mut masked_s = log_s;
            let mut masked_t = soft_t;
            let mut count = 0usize;
            for (i, (&label, &am)) in batch.labels.iter().zip(t_argmax.iter()).enumerate() {
                if label == am {
                    count += 1;
                } else {
                    masked_s.row_mut(i).fill(0.0);
                    masked_t.row_mut(i).fill(0.0);
                }
            }
            let loss = if count == 0 {
                0.0
            } else {
                kl_div_sum(&masked_s, &masked_t) * t * t / count as f32
            };
            out.insert(format!("loss_gkd_{}_{}", pair.0, pair.1), loss)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn ensemble(names: &[(&str, Array2<f32>)]) -> ModelOutput {
        ModelOutput::map(
            names
                .iter()
                .map(|(n, t)| (n.to_string(), ModelOutput::Tensor(t.clone())))
                .collect(),
        )
        .unwrap()
    }

    fn batch(labels: Vec<i64>) -> Batch {
        Batch {
            inputs: Array2::zeros((labels.len(), 1)),
            labels: Array1::from_vec(labels),
        }
    }

    #[test]
    fn test_gt_ce_suffixes_model_name() {
        let loss = DistillationGTCELoss::new(
            CELoss::new(None).unwrap(),
            vec!["Student".to_string()],
            None,
        )
        .unwrap();
        let predicts = ensemble(&[("Student", array![[2.0_f32, 0.0]])]);
        let d = loss.forward(&predicts, &batch(vec![0])).unwrap();
        let keys: Vec<&str> = d.keys().collect();
        assert_eq!(keys, vec!["CELoss_Student"]);
    }

    #[test]
    fn test_ce_two_pairs_distinct_keys() {
        let loss = DistillationCELoss::new(
            CELoss::new(None).unwrap(),
            vec![
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "C".to_string()),
            ],
            None,
        )
        .unwrap();
        let logits = array![[1.0_f32, 0.0]];
        let predicts = ensemble(&[
            ("A", logits.clone()),
            ("B", logits.clone()),
            ("C", logits.clone()),
        ]);
        let d = loss.forward(&predicts, &batch(vec![0])).unwrap();
        let keys: Vec<&str> = d.keys().collect();
        assert_eq!(keys, vec!["CELoss_A_B", "CELoss_A_C"]);
    }

    #[test]
    fn test_duplicate_pair_collides_loudly() {
        let loss = DistillationCELoss::new(
            CELoss::new(None).unwrap(),
            vec![
                ("A".to_string(), "B".to_string()),
                ("A".to_string(), "B".to_string()),
            ],
            None,
        )
        .unwrap();
        let logits = array![[1.0_f32, 0.0]];
        let predicts = ensemble(&[("A", logits.clone()), ("B", logits)]);
        let err = loss.forward(&predicts, &batch(vec![0])).unwrap_err();
        assert!(matches!(err, Error::LossKeyCollision(_)));
    }

    #[test]
    fn test_missing_model_name_errors() {
        let loss = DistillationCELoss::new(
            CELoss::new(None).unwrap(),
            vec![("Student".to_string(), "Teacher".to_string())],
            None,
        )
        .unwrap();
        let predicts = ensemble(&[("Student", array![[1.0_f32, 0.0]])]);
        assert!(loss.forward(&predicts, &batch(vec![0])).is_err());
    }

    #[test]
    fn test_dml_indexed_keys() {
        let loss = DistillationDMLLoss::new(
            DMLLoss::new(),
            vec![("S".to_string(), "T".to_string())],
            None,
        )
        .unwrap();
        let logits = array![[1.0_f32, -1.0]];
        let predicts = ensemble(&[("S", logits.clone()), ("T", logits)]);
        let d = loss.forward(&predicts, &batch(vec![0])).unwrap();
        assert!(d.contains("DMLLoss_S_T_0"));
    }

    #[test]
    fn test_distance_key_format() {
        let loss = DistillationDistanceLoss::new(
            DistanceLoss::new(crate::loss::DistanceMode::L2),
            "loss_l2",
            vec![("S".to_string(), "T".to_string())],
            None,
        )
        .unwrap();
        let x = array![[1.0_f32, 2.0]];
        let predicts = ensemble(&[("S", x.clone()), ("T", x)]);
        let d = loss.forward(&predicts, &batch(vec![0])).unwrap();
        assert!(d.contains("loss_l2_loss_l2_0"));
    }

    #[test]
    fn test_rkd_emits_angle_and_distance() {
        let loss = DistillationRKDLoss::new(
            vec![("Student".to_string(), "Teacher".to_string())],
            vec!["feat".to_string()],
            vec!["feat".to_string()],
        )
        .unwrap();
        let feats = array![[0.0_f32, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let sub = ModelOutput::map(vec![(
            "feat".to_string(),
            ModelOutput::Tensor(feats.clone()),
        )])
        .unwrap();
        let predicts = ModelOutput::map(vec![
            ("Student".to_string(), sub.clone()),
            ("Teacher".to_string(), sub),
        ])
        .unwrap();
        let d = loss.forward(&predicts, &batch(vec![0, 1, 2])).unwrap();
        assert!(d.contains("loss_angle_0_Student_Teacher"));
        assert!(d.contains("loss_dist_0_Student_Teacher"));
    }

    #[test]
    fn test_kldiv_attention_mode_keys() {
        let loss = DistillationKLDivLoss::new(
            KLDivLoss::new(2.0).unwrap(),
            vec![("Student".to_string(), "Student".to_string())],
            KLDivKeySelect::Attention("attn1".to_string(), "attn2".to_string()),
        )
        .unwrap();
        let x = array![[1.0_f32, 0.0]];
        let sub = ModelOutput::map(vec![
            ("attn1".to_string(), ModelOutput::Tensor(x.clone())),
            ("attn2".to_string(), ModelOutput::Tensor(x)),
        ])
        .unwrap();
        let predicts = ModelOutput::map(vec![("Student".to_string(), sub)]).unwrap();
        let d = loss.forward(&predicts, &batch(vec![0])).unwrap();
        assert!(d.contains("KLDivLoss_attn1_attn2"));
    }

    #[test]
    fn test_guided_kl_zero_agreement_contributes_zero() {
        let loss = DistillationGuidedKLDivLoss::new(
            vec![("Student".to_string(), "Teacher".to_string())],
            4.0,
            None,
        )
        .unwrap();
        // teacher argmax is class 1 for every row; labels say class 0
        let student = array![[0.5_f32, 0.2], [0.1, 0.3]];
        let teacher = array![[0.0_f32, 5.0], [0.0, 5.0]];
        let predicts = ensemble(&[("Student", student), ("Teacher", teacher)]);
        let d = loss.forward(&predicts, &batch(vec![0, 0])).unwrap();
        let v = d.get("loss_gkd_Student_Teacher").unwrap();
        assert_eq!(v, 0.0);
        assert!(v.is_finite());
    }

    #[test]
    fn test_guided_kl_partial_agreement_finite() {
        let loss = DistillationGuidedKLDivLoss::new(
            vec![("Student".to_string(), "Teacher".to_string())],
            4.0,
            None,
        )
        .unwrap();
        let student = array![[0.5_f32, 0.2], [0.1, 0.3]];
        let teacher = array![[5.0_f32, 0.0], [0.0, 5.0]];
        // row 0 agrees (label 0), row 1 disagrees (label 0, argmax 1)
        let predicts = ensemble(&[("Student", student), ("Teacher", teacher)]);
        let d = loss.forward(&predicts, &batch(vec![0, 0])).unwrap();
        let v = d.get("loss_gkd_Student_Teacher").unwrap();
        assert!(v.is_finite());
        assert!(v > 0.0);
    }
}
