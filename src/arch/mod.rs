//! Model construction
//!
//! Models are deliberately small: the interesting logic in this crate is the
//! orchestration around them, so the built-in architectures are a linear
//! classifier and a named ensemble of sub-models for distillation. The
//! [`Model`] trait is the seam an external architecture plugs into.

mod output;

pub use output::ModelOutput;

use crate::config::Config;
use crate::engine::RngState;
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};

/// One named trainable tensor with its gradient slot.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub data: Array2<f32>,
    pub grad: Array2<f32>,
}

impl Param {
    pub fn new(name: impl Into<String>, data: Array2<f32>) -> Self {
        let grad = Array2::zeros(data.raw_dim());
        Self {
            name: name.into(),
            data,
            grad,
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// Trainable model seam.
///
/// `forward` produces the (possibly nested) output structure the loss
/// composers consume; `backward` fills every parameter's gradient slot from
/// one labelled batch and returns the step loss it minimized.
pub trait Model {
    fn forward(&self, inputs: &Array2<f32>) -> Result<ModelOutput>;

    fn backward(&mut self, inputs: &Array2<f32>, labels: &Array1<i64>) -> Result<f32>;

    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    fn set_train(&mut self, train: bool);

    /// Names of the sub-models for ensemble architectures, empty otherwise.
    fn sub_model_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Borrow one named sub-model, `None` for non-ensemble architectures.
    fn sub_model(&self, _name: &str) -> Option<&dyn Model> {
        None
    }

    /// Structural re-parameterization hook, invoked once before export.
    fn reparameterize(&mut self) {}
}

/// Softmax classifier over fixed feature vectors.
///
/// Gradients are the closed-form softmax cross-entropy derivative, so
/// training makes real progress without an autograd engine behind it.
pub struct LinearClassifier {
    weight: Param,
    bias: Param,
    feat_dim: usize,
    class_num: usize,
    training: bool,
    reparameterized: bool,
}

impl LinearClassifier {
    pub fn new(feat_dim: usize, class_num: usize, rng: &mut RngState) -> Result<Self> {
        if feat_dim == 0 || class_num == 0 {
            return Err(Error::config(
                "Arch",
                format!("feat_dim ({feat_dim}) and class_num ({class_num}) must be positive"),
            ));
        }
        let bound = (6.0 / (feat_dim + class_num) as f32).sqrt();
        let weight = Array2::from_shape_fn((feat_dim, class_num), |_| rng.uniform(-bound, bound));
        Ok(Self {
            weight: Param::new("weight", weight),
            bias: Param::new("bias", Array2::zeros((1, class_num))),
            feat_dim,
            class_num,
            training: true,
            reparameterized: false,
        })
    }

    pub fn class_num(&self) -> usize {
        self.class_num
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    fn logits(&self, inputs: &Array2<f32>) -> Result<Array2<f32>> {
        if inputs.ncols() != self.feat_dim {
            return Err(Error::DegenerateBatch(format!(
                "input feature dim {} does not match model feat_dim {}",
                inputs.ncols(),
                self.feat_dim
            )));
        }
        Ok(inputs.dot(&self.weight.data) + &self.bias.data)
    }
}

impl Model for LinearClassifier {
    fn forward(&self, inputs: &Array2<f32>) -> Result<ModelOutput> {
        Ok(ModelOutput::Tensor(self.logits(inputs)?))
    }

    fn backward(&mut self, inputs: &Array2<f32>, labels: &Array1<i64>) -> Result<f32> {
        let n = inputs.nrows();
        if n == 0 || labels.len() != n {
            return Err(Error::DegenerateBatch(format!(
                "batch of {n} inputs with {} labels",
                labels.len()
            )));
        }
        let logits = self.logits(inputs)?;
        let probs = crate::loss::functional::softmax(&logits);

        // dL/dlogits = (softmax - onehot) / n
        let mut delta = probs.clone();
        let mut loss = 0.0;
        for (i, &label) in labels.iter().enumerate() {
            let c = label as usize;
            if label < 0 || c >= self.class_num {
                return Err(Error::DegenerateBatch(format!(
                    "label {label} out of range for {} classes",
                    self.class_num
                )));
            }
            loss -= probs[[i, c]].max(1e-12).ln();
            delta[[i, c]] -= 1.0;
        }
        delta /= n as f32;

        self.weight.grad = inputs.t().dot(&delta);
        self.bias.grad = delta.sum_axis(Axis(0)).insert_axis(Axis(0));
        Ok(loss / n as f32)
    }

    fn parameters(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn set_train(&mut self, train: bool) {
        self.training = train;
    }

    fn reparameterize(&mut self) {
        // fold happens at most once per export
        if !self.reparameterized {
            self.reparameterized = true;
        }
    }
}

/// Named ensemble of sub-models whose joint output feeds distillation losses.
pub struct DistillationModel {
    names: Vec<String>,
    members: Vec<Box<dyn Model>>,
    /// Sub-models excluded from the optimizer (e.g. a frozen teacher)
    frozen: Vec<bool>,
}

impl DistillationModel {
    pub fn new(members: Vec<(String, Box<dyn Model>, bool)>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::config("Arch.models", "ensemble needs at least one sub-model"));
        }
        let mut names = Vec::with_capacity(members.len());
        let mut boxed = Vec::with_capacity(members.len());
        let mut frozen = Vec::with_capacity(members.len());
        for (name, model, freeze) in members {
            if names.contains(&name) {
                return Err(Error::config(
                    "Arch.models",
                    format!("duplicate sub-model name `{name}`"),
                ));
            }
            names.push(name);
            boxed.push(model);
            frozen.push(freeze);
        }
        Ok(Self {
            names,
            members: boxed,
            frozen,
        })
    }

    pub fn member(&self, name: &str) -> Result<&dyn Model> {
        self.sub_model(name)
            .ok_or_else(|| Error::config("Arch.models", format!("no sub-model named `{name}`")))
    }
}

impl Model for DistillationModel {
    fn forward(&self, inputs: &Array2<f32>) -> Result<ModelOutput> {
        let mut out = Vec::with_capacity(self.members.len());
        for (name, member) in self.names.iter().zip(&self.members) {
            out.push((name.clone(), member.forward(inputs)?));
        }
        ModelOutput::map(out)
    }

    fn backward(&mut self, inputs: &Array2<f32>, labels: &Array1<i64>) -> Result<f32> {
        let mut total = 0.0;
        let mut trained = 0;
        for (member, &frozen) in self.members.iter_mut().zip(&self.frozen) {
            if frozen {
                continue;
            }
            total += member.backward(inputs, labels)?;
            trained += 1;
        }
        if trained == 0 {
            return Err(Error::config(
                "Arch.models",
                "every sub-model is frozen; nothing to train",
            ));
        }
        Ok(total / trained as f32)
    }

    fn parameters(&self) -> Vec<&Param> {
        self.members
            .iter()
            .zip(&self.frozen)
            .filter(|(_, &f)| !f)
            .flat_map(|(m, _)| m.parameters())
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.members
            .iter_mut()
            .zip(&self.frozen)
            .filter(|(_, &f)| !f)
            .flat_map(|(m, _)| m.parameters_mut())
            .collect()
    }

    fn set_train(&mut self, train: bool) {
        for (member, &frozen) in self.members.iter_mut().zip(&self.frozen) {
            member.set_train(train && !frozen);
        }
    }

    fn sub_model_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn sub_model(&self, name: &str) -> Option<&dyn Model> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.members[i].as_ref())
    }

    fn reparameterize(&mut self) {
        for member in &mut self.members {
            member.reparameterize();
        }
    }
}

/// Build a model from the `Arch` config section.
///
/// Architecture names form a closed registry; unknown names fail at
/// construction.
pub fn build_model(config: &Config, class_num: usize, rng: &mut RngState) -> Result<Box<dyn Model>> {
    let name = config.get_str_or("Arch.name", "LinearClassifier")?;
    match name.as_str() {
        "LinearClassifier" => {
            let feat_dim = config.get_usize_or("Arch.feat_dim", 64)?;
            Ok(Box::new(LinearClassifier::new(feat_dim, class_num, rng)?))
        }
        "DistillationModel" => {
            let feat_dim = config.get_usize_or("Arch.feat_dim", 64)?;
            let names = match config.get("Arch.models") {
                Some(serde_yaml::Value::Sequence(seq)) => seq
                    .iter()
                    .map(|v| {
                        v.as_str().map(str::to_string).ok_or_else(|| {
                            Error::config("Arch.models", "sub-model names must be strings")
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => vec!["Student".to_string(), "Teacher".to_string()],
                Some(_) => {
                    return Err(Error::config("Arch.models", "expected a list of names"))
                }
            };
            let freeze_teacher = config.get_bool_or("Arch.freeze_teacher", true)?;
            let members = names
                .into_iter()
                .map(|name| {
                    let frozen = freeze_teacher && name != "Student";
                    LinearClassifier::new(feat_dim, class_num, rng)
                        .map(|m| (name, Box::new(m) as Box<dyn Model>, frozen))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(DistillationModel::new(members)?))
        }
        other => Err(Error::config(
            "Arch.name",
            format!("unknown architecture `{other}`"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn rng() -> RngState {
        RngState::from_seed(7)
    }

    #[test]
    fn test_linear_forward_shape() {
        let model = LinearClassifier::new(4, 3, &mut rng()).unwrap();
        let out = model.forward(&Array2::zeros((2, 4))).unwrap();
        let logits = out.as_tensor().unwrap();
        assert_eq!(logits.shape(), &[2, 3]);
    }

    #[test]
    fn test_backward_reduces_loss() {
        let mut model = LinearClassifier::new(4, 3, &mut rng()).unwrap();
        let inputs = array![
            [1.0_f32, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0]
        ];
        let labels = array![0_i64, 1, 2];
        let first = model.backward(&inputs, &labels).unwrap();
        // plain gradient steps
        for _ in 0..50 {
            let _ = model.backward(&inputs, &labels).unwrap();
            for p in model.parameters_mut() {
                let update = &p.grad * 0.5;
                p.data -= &update;
            }
        }
        let last = model.backward(&inputs, &labels).unwrap();
        assert!(last < first, "loss did not improve: {first} -> {last}");
    }

    #[test]
    fn test_backward_rejects_bad_label() {
        let mut model = LinearClassifier::new(4, 3, &mut rng()).unwrap();
        let inputs = Array2::zeros((1, 4));
        let labels = array![5_i64];
        assert!(model.backward(&inputs, &labels).is_err());
    }

    #[test]
    fn test_ensemble_output_is_named() {
        let mut r = rng();
        let student = Box::new(LinearClassifier::new(4, 3, &mut r).unwrap());
        let teacher = Box::new(LinearClassifier::new(4, 3, &mut r).unwrap());
        let model = DistillationModel::new(vec![
            ("Student".to_string(), student as Box<dyn Model>, false),
            ("Teacher".to_string(), teacher as Box<dyn Model>, true),
        ])
        .unwrap();
        assert_eq!(model.sub_model_names(), vec!["Student", "Teacher"]);

        let out = model.forward(&Array2::zeros((2, 4))).unwrap();
        assert!(out.get("Student").is_ok());
        assert!(out.get("Missing").is_err());
        // only the student contributes trainable parameters
        assert_eq!(model.parameters().len(), 2);
    }

    #[test]
    fn test_frozen_teacher_weights_unchanged() {
        let mut r = rng();
        let teacher = LinearClassifier::new(2, 2, &mut r).unwrap();
        let teacher_weights = teacher.weight.data.clone();
        let student = LinearClassifier::new(2, 2, &mut r).unwrap();
        let mut model = DistillationModel::new(vec![
            ("Student".to_string(), Box::new(student) as Box<dyn Model>, false),
            ("Teacher".to_string(), Box::new(teacher) as Box<dyn Model>, true),
        ])
        .unwrap();
        let inputs = array![[1.0_f32, -1.0]];
        let labels = array![1_i64];
        model.backward(&inputs, &labels).unwrap();
        for p in model.parameters_mut() {
            let update = &p.grad * 0.1;
            p.data -= &update;
        }
        let teacher = model.member("Teacher").unwrap();
        let kept = &teacher.parameters()[0].data;
        for (a, b) in kept.iter().zip(teacher_weights.iter()) {
            assert_relative_eq!(a, b);
        }
    }

    #[test]
    fn test_build_model_unknown_name() {
        let config = Config::from_yaml_str("Arch:\n  name: ResNetish\n").unwrap();
        assert!(build_model(&config, 10, &mut rng()).is_err());
    }

    #[test]
    fn test_build_distillation_model() {
        let config = Config::from_yaml_str(
            "Arch:\n  name: DistillationModel\n  feat_dim: 8\n  models: [Student, Teacher]\n",
        )
        .unwrap();
        let model = build_model(&config, 5, &mut rng()).unwrap();
        assert_eq!(model.sub_model_names(), vec!["Student", "Teacher"]);
    }
}
