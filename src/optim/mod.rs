//! Optimizers and learning-rate schedules

mod scheduler;

pub use scheduler::{build_scheduler, Cosine, LRScheduler, Piecewise, ReduceOnPlateau};

use crate::arch::Param;
use crate::config::Config;
use crate::{Error, Result};
use ndarray::Array2;

/// First-order optimizer over a flat parameter list.
///
/// Parameter order must be stable across calls; per-parameter state is kept
/// by position.
pub trait Optimizer {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<()>;

    fn zero_grad(&self, params: &mut [&mut Param]) {
        for p in params.iter_mut() {
            p.zero_grad();
        }
    }

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);
}

fn check_state_len(state: &[Array2<f32>], params: &[&mut Param], who: &str) -> Result<()> {
    if !state.is_empty() && state.len() != params.len() {
        return Err(Error::config(
            who,
            format!(
                "parameter count changed mid-run: {} tracked, {} given",
                state.len(),
                params.len()
            ),
        ));
    }
    Ok(())
}

/// SGD with classical momentum and L2-coupled weight decay.
pub struct Momentum {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<Array2<f32>>,
}

impl Momentum {
    pub fn new(lr: f32, momentum: f32, weight_decay: f32) -> Result<Self> {
        if lr <= 0.0 {
            return Err(Error::config("Optimizer.lr", format!("lr {lr} must be positive")));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(Error::config(
                "Optimizer.momentum",
                format!("momentum {momentum} must be in [0, 1)"),
            ));
        }
        Ok(Self {
            lr,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        })
    }
}

impl Optimizer for Momentum {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
        check_state_len(&self.velocity, params, "Momentum")?;
        if self.velocity.is_empty() {
            self.velocity = params
                .iter()
                .map(|p| Array2::zeros(p.data.raw_dim()))
                .collect();
        }
        for (p, v) in params.iter_mut().zip(&mut self.velocity) {
            let mut grad = p.grad.clone();
            if self.weight_decay > 0.0 {
                grad = grad + &p.data * self.weight_decay;
            }
            *v = &*v * self.momentum + &grad;
            p.data = &p.data - &(&*v * self.lr);
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// AdamW: Adam moments with weight decay applied directly to the weights
/// rather than folded into the gradient.
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Array2<f32>>,
    v: Vec<Array2<f32>>,
}

impl AdamW {
    pub fn new(lr: f32, beta1: f32, beta2: f32, weight_decay: f32) -> Result<Self> {
        if lr <= 0.0 {
            return Err(Error::config("Optimizer.lr", format!("lr {lr} must be positive")));
        }
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(Error::config(
                "Optimizer",
                format!("betas ({beta1}, {beta2}) must be in [0, 1)"),
            ));
        }
        Ok(Self {
            lr,
            beta1,
            beta2,
            epsilon: 1e-8,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        })
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
        check_state_len(&self.m, params, "AdamW")?;
        if self.m.is_empty() {
            self.m = params
                .iter()
                .map(|p| Array2::zeros(p.data.raw_dim()))
                .collect();
            self.v = self.m.clone();
        }
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        for ((p, m), v) in params.iter_mut().zip(&mut self.m).zip(&mut self.v) {
            *m = &*m * self.beta1 + &(&p.grad * (1.0 - self.beta1));
            *v = &*v * self.beta2 + &(&p.grad * &p.grad * (1.0 - self.beta2));
            let m_hat = &*m / bc1;
            let v_hat = &*v / bc2;
            let update = m_hat / (v_hat.mapv(f32::sqrt) + self.epsilon);
            p.data = &p.data - &(update * self.lr);
            if self.weight_decay > 0.0 {
                p.data = &p.data * (1.0 - self.lr * self.weight_decay);
            }
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Build the optimizer from the `Optimizer` config section. Names form a
/// closed registry.
pub fn build_optimizer(config: &Config) -> Result<Box<dyn Optimizer>> {
    let name = config.get_str_or("Optimizer.name", "Momentum")?;
    let lr = config.get_f64_or("Optimizer.lr", 0.1)? as f32;
    let weight_decay = config.get_f64_or("Optimizer.weight_decay", 0.0)? as f32;
    match name.as_str() {
        "Momentum" => {
            let momentum = config.get_f64_or("Optimizer.momentum", 0.9)? as f32;
            Ok(Box::new(Momentum::new(lr, momentum, weight_decay)?))
        }
        "AdamW" => {
            let beta1 = config.get_f64_or("Optimizer.beta1", 0.9)? as f32;
            let beta2 = config.get_f64_or("Optimizer.beta2", 0.999)? as f32;
            Ok(Box::new(AdamW::new(lr, beta1, beta2, weight_decay)?))
        }
        other => Err(Error::config(
            "Optimizer.name",
            format!("unknown optimizer `{other}`"),
        )),
    }
}
