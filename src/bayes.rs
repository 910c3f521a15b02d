//! # 逐次モデルベース最適化
//!
//! ガウス過程（Matérn 5/2 カーネル）を代理モデルとし、期待改善量（EI）が最大の点を
//! 次の評価点として提案します。実数・整数・カテゴリの次元を混在できます。
//!
//! 代理モデルの入力は単位超立方体に正規化した特徴量です。実数と整数は `[0, 1]` に
//! 線形（または対数）で写し、カテゴリは one-hot で表します。

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use tracing::debug;

use crate::error::{Error, Result};

/// 探索空間の1次元。
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Real {
        name: String,
        low: f64,
        high: f64,
        log_scale: bool,
    },
    Integer {
        name: String,
        low: i64,
        high: i64,
    },
    Categorical {
        name: String,
        choices: usize,
    },
}

/// 探索空間上の1成分の値。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Real(f64),
    Integer(i64),
    Category(usize),
}

impl Value {
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<usize> {
        match self {
            Value::Category(v) => Some(*v),
            _ => None,
        }
    }
}

impl Dimension {
    pub fn name(&self) -> &str {
        match self {
            Dimension::Real { name, .. }
            | Dimension::Integer { name, .. }
            | Dimension::Categorical { name, .. } => name,
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = match self {
            Dimension::Real {
                low,
                high,
                log_scale,
                ..
            } => low < high && (!log_scale || *low > 0.0),
            Dimension::Integer { low, high, .. } => low <= high,
            Dimension::Categorical { choices, .. } => *choices > 0,
        };
        if valid {
            Ok(())
        } else {
            Err(Error::Search(format!("invalid dimension '{}'", self.name())))
        }
    }

    /// 代理モデル上での特徴量の数。
    fn width(&self) -> usize {
        match self {
            Dimension::Categorical { choices, .. } => *choices,
            _ => 1,
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Dimension::Real {
                low,
                high,
                log_scale: true,
                ..
            } => Value::Real(rng.random_range(low.ln()..=high.ln()).exp()),
            Dimension::Real { low, high, .. } => Value::Real(rng.random_range(*low..=*high)),
            Dimension::Integer { low, high, .. } => Value::Integer(rng.random_range(*low..=*high)),
            Dimension::Categorical { choices, .. } => {
                Value::Category(rng.random_range(0..*choices))
            }
        }
    }

    fn contains(&self, value: &Value) -> bool {
        match (self, value) {
            (Dimension::Real { low, high, .. }, Value::Real(v)) => (*low..=*high).contains(v),
            (Dimension::Integer { low, high, .. }, Value::Integer(v)) => (*low..=*high).contains(v),
            (Dimension::Categorical { choices, .. }, Value::Category(v)) => v < choices,
            _ => false,
        }
    }

    fn encode(&self, value: &Value, features: &mut Vec<f64>) {
        match (self, value) {
            (
                Dimension::Real {
                    low,
                    high,
                    log_scale,
                    ..
                },
                Value::Real(v),
            ) => {
                let unit = if *log_scale {
                    (v.ln() - low.ln()) / (high.ln() - low.ln())
                } else {
                    (v - low) / (high - low)
                };
                features.push(unit);
            }
            (Dimension::Integer { low, high, .. }, Value::Integer(v)) => {
                let span = (high - low).max(1) as f64;
                features.push((v - low) as f64 / span);
            }
            (Dimension::Categorical { choices, .. }, Value::Category(v)) => {
                features.extend((0..*choices).map(|i| if i == *v { 1.0 } else { 0.0 }));
            }
            // contains() で弾かれるため到達しない
            _ => features.extend(std::iter::repeat_n(0.0, self.width())),
        }
    }
}

/// 探索空間。
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    dimensions: Vec<Dimension>,
}

impl SearchSpace {
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(Error::Search("search space is empty".to_string()));
        }
        for dimension in &dimensions {
            dimension.validate()?;
        }
        Ok(Self { dimensions })
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<Value> {
        self.dimensions.iter().map(|d| d.sample(rng)).collect()
    }

    pub fn contains(&self, point: &[Value]) -> bool {
        point.len() == self.dimensions.len()
            && self.dimensions.iter().zip(point).all(|(d, v)| d.contains(v))
    }

    /// 代理モデル用の特徴量ベクトル。
    pub fn encode(&self, point: &[Value]) -> Vec<f64> {
        let mut features = Vec::with_capacity(self.dimensions.iter().map(Dimension::width).sum());
        for (dimension, value) in self.dimensions.iter().zip(point) {
            dimension.encode(value, &mut features);
        }
        features
    }
}

/// Matérn 5/2 カーネル（信号分散 1）。
fn matern52(a: ArrayView1<f64>, b: ArrayView1<f64>, length_scale: f64) -> f64 {
    let r = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
        / length_scale;
    let s = 5f64.sqrt() * r;
    (1.0 + s + s * s / 3.0) * (-s).exp()
}

/// 下三角のコレスキー分解 `A = L Lᵀ`。
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// `L x = b` を前進代入で解きます。
fn solve_lower(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// `Lᵀ x = b` を後退代入で解きます。
fn solve_upper_transposed(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = b[i];
        for k in i + 1..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// 候補とする長さスケール。対数周辺尤度が最大のものを採用します。
const LENGTH_SCALES: [f64; 6] = [0.05, 0.1, 0.2, 0.5, 1.0, 2.0];

/// 観測ノイズ（正規化後の分散）
const NOISE: f64 = 1e-6;

/// ガウス過程回帰の代理モデル。
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    x: Array2<f64>,
    chol: Array2<f64>,
    alpha: Array1<f64>,
    length_scale: f64,
    y_mean: f64,
    y_std: f64,
}

impl GaussianProcess {
    /// 観測点 `x`（行が1点）と目的関数値 `y` に当てはめます。
    pub fn fit(x: Array2<f64>, y: &[f64]) -> Result<Self> {
        if x.nrows() != y.len() || y.is_empty() {
            return Err(Error::Search(format!(
                "{} observations but {} targets",
                x.nrows(),
                y.len()
            )));
        }
        let n = y.len() as f64;
        let y_mean = y.iter().sum::<f64>() / n;
        let variance = y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / n;
        let y_std = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        let targets = Array1::from_iter(y.iter().map(|v| (v - y_mean) / y_std));

        let mut best: Option<(f64, Self)> = None;
        for length_scale in LENGTH_SCALES {
            let Some(chol) = cholesky(&Self::kernel_matrix(&x, length_scale)) else {
                continue;
            };
            let alpha = solve_upper_transposed(&chol, &solve_lower(&chol, &targets));
            let log_likelihood = -0.5 * targets.dot(&alpha)
                - chol.diag().iter().map(|d| d.ln()).sum::<f64>()
                - 0.5 * n * (2.0 * std::f64::consts::PI).ln();
            debug!(length_scale, log_likelihood, "GP の当てはめ");

            if best.as_ref().is_none_or(|(ll, _)| log_likelihood > *ll) {
                let model = Self {
                    x: x.clone(),
                    chol,
                    alpha,
                    length_scale,
                    y_mean,
                    y_std,
                };
                best = Some((log_likelihood, model));
            }
        }
        best.map(|(_, model)| model)
            .ok_or_else(|| Error::Search("kernel matrix is not positive definite".to_string()))
    }

    fn kernel_matrix(x: &Array2<f64>, length_scale: f64) -> Array2<f64> {
        let n = x.nrows();
        Array2::from_shape_fn((n, n), |(i, j)| {
            let k = matern52(x.row(i), x.row(j), length_scale);
            if i == j { k + NOISE } else { k }
        })
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    /// 予測平均と予測標準偏差（元のスケール）。
    pub fn predict(&self, point: ArrayView1<f64>) -> (f64, f64) {
        let k = Array1::from_iter(
            self.x
                .rows()
                .into_iter()
                .map(|row| matern52(row, point, self.length_scale)),
        );
        let mean = k.dot(&self.alpha);
        let v = solve_lower(&self.chol, &k);
        let variance = (1.0 - v.dot(&v)).max(1e-12);
        (
            mean * self.y_std + self.y_mean,
            variance.sqrt() * self.y_std,
        )
    }
}

/// 最小化問題に対する期待改善量。
pub fn expected_improvement(mean: f64, std: f64, best: f64, xi: f64) -> f64 {
    let improvement = best - mean - xi;
    if std <= 0.0 {
        return improvement.max(0.0);
    }
    // 標準正規分布のパラメータは常に有効
    let normal = Normal::standard();
    let z = improvement / std;
    improvement * normal.cdf(z) + std * normal.pdf(z)
}

/// 1回の評価結果。
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub point: Vec<Value>,
    pub value: f64,
}

/// 最適化の結果。
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub best: Observation,
    pub observations: Vec<Observation>,
}

impl OptimizationResult {
    /// 各呼び出し時点までの最小値（収束曲線）。
    pub fn convergence(&self) -> Vec<f64> {
        self.observations
            .iter()
            .scan(f64::INFINITY, |best, o| {
                *best = best.min(o.value);
                Some(*best)
            })
            .collect()
    }
}

/// ask/tell 形式のベイズ最適化。
#[derive(Debug, Clone)]
pub struct BayesianOptimizer {
    space: SearchSpace,
    rng: StdRng,
    n_initial_points: usize,
    n_candidates: usize,
    xi: f64,
    observations: Vec<Observation>,
}

impl BayesianOptimizer {
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            n_initial_points: 10,
            n_candidates: 2000,
            xi: 0.01,
            observations: Vec::new(),
        }
    }

    /// 代理モデルを使わずにランダムに提案する回数。
    pub fn with_initial_points(mut self, n_initial_points: usize) -> Self {
        self.n_initial_points = n_initial_points;
        self
    }

    /// EI を評価するランダム候補の数。
    pub fn with_candidates(mut self, n_candidates: usize) -> Self {
        self.n_candidates = n_candidates.max(1);
        self
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// 次に評価する点を提案します。
    pub fn ask(&mut self) -> Result<Vec<Value>> {
        if self.observations.len() < self.n_initial_points.max(1) {
            return Ok(self.space.sample(&mut self.rng));
        }

        let features = self
            .observations
            .iter()
            .map(|o| self.space.encode(&o.point))
            .collect::<Vec<_>>();
        let width = features[0].len();
        let x = Array2::from_shape_vec(
            (features.len(), width),
            features.into_iter().flatten().collect(),
        )
        .map_err(|e| Error::Search(e.to_string()))?;
        let y = self.observations.iter().map(|o| o.value).collect::<Vec<_>>();
        let gp = GaussianProcess::fit(x, &y)?;
        let best = y.iter().copied().fold(f64::INFINITY, f64::min);

        let mut proposal = None;
        let mut best_ei = f64::NEG_INFINITY;
        for _ in 0..self.n_candidates {
            let candidate = self.space.sample(&mut self.rng);
            let encoded = Array1::from(self.space.encode(&candidate));
            let (mean, std) = gp.predict(encoded.view());
            let ei = expected_improvement(mean, std, best, self.xi);
            if ei > best_ei {
                best_ei = ei;
                proposal = Some(candidate);
            }
        }
        debug!(
            expected_improvement = best_ei,
            length_scale = gp.length_scale(),
            "次の評価点"
        );
        proposal.ok_or_else(|| Error::Search("no candidate was proposed".to_string()))
    }

    /// 評価結果を登録します。
    pub fn tell(&mut self, point: Vec<Value>, value: f64) -> Result<()> {
        if !self.space.contains(&point) {
            return Err(Error::Search(format!("point {point:?} is outside the space")));
        }
        self.observations.push(Observation { point, value });
        Ok(())
    }

    /// `objective` を `n_calls` 回評価して最小化します。`x0` があれば最初に評価します。
    pub fn minimize<F>(
        &mut self,
        mut objective: F,
        n_calls: usize,
        x0: Option<Vec<Value>>,
    ) -> Result<OptimizationResult>
    where
        F: FnMut(&[Value]) -> Result<f64>,
    {
        if n_calls == 0 {
            return Err(Error::Search("n_calls must be positive".to_string()));
        }
        let mut pending = x0;
        for _ in 0..n_calls {
            let point = match pending.take() {
                Some(point) => point,
                None => self.ask()?,
            };
            let value = objective(&point)?;
            self.tell(point, value)?;
        }

        let best = self
            .observations
            .iter()
            .min_by(|a, b| a.value.total_cmp(&b.value))
            .cloned()
            .ok_or_else(|| Error::Search("no observations".to_string()))?;
        Ok(OptimizationResult {
            best,
            observations: self.observations.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        SearchSpace::new(vec![
            Dimension::Real {
                name: "x".to_string(),
                low: -2.0,
                high: 2.0,
                log_scale: false,
            },
            Dimension::Integer {
                name: "n".to_string(),
                low: 1,
                high: 5,
            },
            Dimension::Categorical {
                name: "c".to_string(),
                choices: 3,
            },
        ])
        .unwrap()
    }

    #[test]
    fn encoding_is_unit_scaled_and_one_hot() {
        let features = space().encode(&[Value::Real(0.0), Value::Integer(5), Value::Category(1)]);
        assert_eq!(features, vec![0.5, 1.0, 0.0, 1.0, 0.0]);

        let log_space = SearchSpace::new(vec![Dimension::Real {
            name: "lr".to_string(),
            low: 1e-4,
            high: 1e-2,
            log_scale: true,
        }])
        .unwrap();
        let middle = log_space.encode(&[Value::Real(1e-3)]);
        assert!((middle[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn samples_stay_inside_the_space() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            assert!(space.contains(&space.sample(&mut rng)));
        }
        assert!(!space.contains(&[Value::Real(3.0), Value::Integer(1), Value::Category(0)]));
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        let log_from_zero = Dimension::Real {
            name: "lr".to_string(),
            low: 0.0,
            high: 1.0,
            log_scale: true,
        };
        assert!(SearchSpace::new(vec![log_from_zero]).is_err());
        assert!(SearchSpace::new(vec![]).is_err());
    }

    #[test]
    fn gp_interpolates_observations() {
        let x = Array2::from_shape_vec((4, 1), vec![0.0, 0.3, 0.6, 1.0]).unwrap();
        let y = [1.0, 0.2, 0.5, 2.0];
        let gp = GaussianProcess::fit(x, &y).unwrap();

        let (mean, std) = gp.predict(Array1::from(vec![0.3]).view());
        assert!((mean - 0.2).abs() < 1e-2);
        assert!(std < 0.05);

        let (_, far_std) = gp.predict(Array1::from(vec![5.0]).view());
        assert!(far_std > std);
    }

    #[test]
    fn expected_improvement_prefers_low_mean_and_high_uncertainty() {
        let ei = |mean, std| expected_improvement(mean, std, 1.0, 0.0);
        assert!(ei(0.0, 0.1) > ei(0.9, 0.1));
        assert!(ei(1.0, 0.5) > ei(1.0, 0.1));
        assert_eq!(expected_improvement(2.0, 0.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn minimize_finds_the_quadratic_bowl() {
        let space = SearchSpace::new(vec![Dimension::Real {
            name: "x".to_string(),
            low: -2.0,
            high: 2.0,
            log_scale: false,
        }])
        .unwrap();
        let mut optimizer = BayesianOptimizer::new(space, 1234)
            .with_initial_points(5)
            .with_candidates(500);
        let result = optimizer
            .minimize(
                |point| {
                    let x = point[0].as_real().unwrap();
                    Ok((x - 0.7).powi(2))
                },
                20,
                Some(vec![Value::Real(-1.5)]),
            )
            .unwrap();

        assert_eq!(result.observations.len(), 20);
        assert_eq!(optimizer.observations(), result.observations.as_slice());
        assert_eq!(optimizer.space().dimensions().len(), 1);
        assert_eq!(result.observations[0].point, vec![Value::Real(-1.5)]);
        assert!(result.best.value < 0.05, "best {}", result.best.value);

        let convergence = result.convergence();
        assert!(convergence.windows(2).all(|w| w[1] <= w[0]));
    }
}
