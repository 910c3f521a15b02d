//! # 残差の組み立て
//!
//! 減衰・外力付きの1次元弦の運動方程式を無次元化した
//!
//! `U_ττ - α² U_XX - β f(X) + K U_τ = 0`
//!
//! の残差と、初期条件の残差を二乗平均誤差として計算します。

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::gradient::{JetModule, directional, unit_direction};
use crate::model::HardConstraint;

/// 弦の物理定数と無次元化のスケール。
#[derive(Config, Debug)]
pub struct WaveProblem {
    /// 変位の最小値 [m]
    #[config(default = "-0.21")]
    pub u_min: f64,
    /// 変位の最大値 [m]
    #[config(default = 0.0)]
    pub u_max: f64,
    #[config(default = 0.0)]
    pub x_min: f64,
    #[config(default = 1.0)]
    pub x_max: f64,
    /// 終了時刻 [s]
    #[config(default = 10.0)]
    pub t_f: f64,
    /// 外力の振幅
    #[config(default = "-3.0")]
    pub f_min: f64,
    /// 張力 T
    #[config(default = 1.0)]
    pub tension: f64,
    /// 線密度 μ
    #[config(default = 1.0)]
    pub density: f64,
    /// 減衰係数 k
    #[config(default = 1.0)]
    pub damping: f64,
    /// 外力の中心（正規化座標）
    #[config(default = 0.2)]
    pub force_position: f64,
    /// 外力のガウス分布の鋭さ
    #[config(default = 400.0)]
    pub force_sharpness: f64,
}

impl WaveProblem {
    pub fn delta_u(&self) -> f64 {
        self.u_max - self.u_min
    }

    pub fn delta_x(&self) -> f64 {
        self.x_max - self.x_min
    }

    /// 波動項の係数 `α² = (T/μ) t_f² / Δx²`
    pub fn alpha2(&self) -> f64 {
        (self.tension / self.density) * self.t_f.powi(2) / self.delta_x().powi(2)
    }

    /// 外力項の係数 `β = t_f² / Δu`
    pub fn beta(&self) -> f64 {
        self.t_f.powi(2) / self.delta_u()
    }

    /// 減衰項の係数 `K = k t_f`
    pub fn damping_coefficient(&self) -> f64 {
        self.damping * self.t_f
    }

    /// 両端固定と初期変位ゼロを厳密に満たす出力変換。
    pub fn hard_constraint(&self) -> HardConstraint {
        HardConstraint {
            scale: self.delta_x().powi(2) * self.t_f,
            offset: self.u_min / self.delta_u(),
        }
    }

    /// 正規化変位 `U` を物理変位 `u` [m] に戻します。
    pub fn to_physical<B: Backend>(&self, normalized: Tensor<B, 2>) -> Tensor<B, 2> {
        normalized.mul_scalar(self.delta_u()).add_scalar(self.u_min)
    }

    /// 正規化座標 `X`（`[バッチ数, 1]`）での外力 `f_min · exp(-s (x - x_f)²)`。
    pub fn forcing<B: Backend>(&self, x_normalized: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = x_normalized
            .mul_scalar(self.delta_x())
            .add_scalar(self.x_min);
        let x_f = self.force_position * self.delta_x() + self.x_min;
        let shifted = x.sub_scalar(x_f);
        (shifted.clone() * shifted)
            .mul_scalar(-self.force_sharpness)
            .exp()
            .mul_scalar(self.f_min)
    }
}

/// ソフト制約として課す初期条件。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialCondition {
    /// 初速度 `u_t(x, 0) = 0`
    Velocity,
    /// 初期変位 `u(x, 0) = target` [m]
    Displacement { target: f64 },
}

/// 各点での方程式の残差（`[バッチ数, 1]`）。最後の軸を時間とみなします。
pub fn pde_residual_points<B: Backend, M: JetModule<B>>(
    model: &M,
    problem: &WaveProblem,
    sample: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let [rows, dims] = sample.dims();
    let along_time = directional(model, sample.clone(), &unit_direction(dims, dims - 1));
    let along_space = directional(model, sample.clone(), &unit_direction(dims, 0));
    let forcing = problem.forcing(sample.slice([0..rows, 0..1]));

    along_time.curvature - along_space.curvature.mul_scalar(problem.alpha2())
        - forcing.mul_scalar(problem.beta())
        + along_time.tangent.mul_scalar(problem.damping_coefficient())
}

/// 方程式の損失。`eps_time` を指定すると時間因果性の重みを掛けます。
pub fn pde_residual<B: Backend, M: JetModule<B>>(
    model: &M,
    problem: &WaveProblem,
    sample: Tensor<B, 2>,
    eps_time: Option<f64>,
) -> Tensor<B, 1> {
    let residual = pde_residual_points(model, problem, sample);
    let squared = residual.clone() * residual;
    match eps_time {
        Some(eps) => (causal_weights(squared.clone(), eps) * squared).mean(),
        None => squared.mean(),
    }
}

/// 時間順に並んだ二乗残差 `r²` に対する因果性の重み。
///
/// `w_i = exp(-eps · Σ_{j<i} r_j² / n)`。重みは勾配の計算から切り離された定数です。
pub fn causal_weights<B: Backend>(squared: Tensor<B, 2>, eps: f64) -> Tensor<B, 2> {
    let [rows, cols] = squared.dims();
    let device = squared.device();
    let values = squared.detach().into_data().iter::<f64>().collect::<Vec<_>>();

    let mut weights = Vec::with_capacity(values.len());
    let mut cumulative = 0.0;
    for value in values {
        weights.push((-eps * cumulative / rows as f64).exp() as f32);
        cumulative += value;
    }
    Tensor::from_data(TensorData::new(weights, [rows, cols]), &device)
}

/// 初期条件の損失。`sample` は最後の軸が 0 の点集合です。
pub fn ic_residual<B: Backend, M: JetModule<B>>(
    model: &M,
    problem: &WaveProblem,
    condition: &InitialCondition,
    sample: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let dims = sample.dims()[1];
    let deviation = match condition {
        InitialCondition::Velocity => {
            let along_time = directional(model, sample, &unit_direction(dims, dims - 1));
            along_time
                .tangent
                .mul_scalar(problem.delta_u() / problem.t_f)
        }
        InitialCondition::Displacement { target } => {
            let along_time = directional(model, sample, &unit_direction(dims, dims - 1));
            problem.to_physical(along_time.value).sub_scalar(*target)
        }
    };
    (deviation.clone() * deviation).mean()
}

/// 方程式の損失と全ての初期条件の損失の和。
pub fn total_loss<B: Backend, M: JetModule<B>>(
    model: &M,
    problem: &WaveProblem,
    conditions: &[InitialCondition],
    domain: Tensor<B, 2>,
    initial: Tensor<B, 2>,
    eps_time: Option<f64>,
) -> Tensor<B, 1> {
    conditions.iter().fold(
        pde_residual(model, problem, domain, eps_time),
        |loss, condition| loss + ic_residual(model, problem, condition, initial.clone()),
    )
}
