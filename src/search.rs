//! # ハイパーパラメータ探索
//!
//! 学習率・隠れ層の数・幅・活性化関数・時間因果性の強さをベイズ最適化で探索します。
//! 1回の評価ごとにモデル・データセット・オプティマイザを新しく作り、学習を最後まで
//! 実行して検証損失の最小値を目的関数値として返します。

use std::path::Path;
use std::time::Instant;

use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::tensor::backend::AutodiffBackend;
use plotters::prelude::*;
use tracing::{info, warn};

use crate::artifacts::RunOutput;
use crate::bayes::{BayesianOptimizer, Dimension, OptimizationResult, SearchSpace, Value};
use crate::error::{self, Error};
use crate::model::ActivationKind;
use crate::training::{Trainer, TrainingConfig, TrainingData};

type MyBackend = Autodiff<NdArray<f32>>;

/// 目的関数値が NaN/無限大になった場合に返すペナルティ
pub const NAN_PENALTY: f64 = 1e5;

/// 探索ログのファイル名
pub const SEARCH_LOG_FILENAME: &str = "search.txt";
/// 最良のハイパーパラメータのファイル名
pub const BEST_FILENAME: &str = "best_hyperparameters.json";
/// 収束グラフのファイル名
pub const CONVERGENCE_PLOT_FILENAME: &str = "convergence.png";

/// 探索するハイパーパラメータ。
#[derive(Config, Debug)]
pub struct Hyperparameters {
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 3)]
    pub num_dense_layers: usize,
    #[config(default = 100)]
    pub num_dense_nodes: usize,
    #[config(default = "ActivationKind::Tanh")]
    pub activation: ActivationKind,
    #[config(default = 100.0)]
    pub eps_time: f64,
}

impl Hyperparameters {
    /// 探索空間の定義。次元の順序は [`Hyperparameters::to_point`] と一致します。
    pub fn space() -> error::Result<SearchSpace> {
        SearchSpace::new(vec![
            Dimension::Real {
                name: "learning_rate".to_string(),
                low: 1e-4,
                high: 5e-2,
                log_scale: true,
            },
            Dimension::Integer {
                name: "num_dense_layers".to_string(),
                low: 1,
                high: 10,
            },
            Dimension::Integer {
                name: "num_dense_nodes".to_string(),
                low: 5,
                high: 500,
            },
            Dimension::Categorical {
                name: "activation".to_string(),
                choices: ActivationKind::ALL.len(),
            },
            Dimension::Real {
                name: "eps_time".to_string(),
                low: 0.1,
                high: 1000.0,
                log_scale: true,
            },
        ])
    }

    pub fn to_point(&self) -> Vec<Value> {
        let category = ActivationKind::ALL
            .iter()
            .position(|a| *a == self.activation)
            .unwrap_or(0);
        vec![
            Value::Real(self.learning_rate),
            Value::Integer(self.num_dense_layers as i64),
            Value::Integer(self.num_dense_nodes as i64),
            Value::Category(category),
            Value::Real(self.eps_time),
        ]
    }

    pub fn from_point(point: &[Value]) -> error::Result<Self> {
        let invalid = || Error::Search(format!("point {point:?} does not match the space"));
        let [learning_rate, layers, nodes, activation, eps_time] = point else {
            return Err(invalid());
        };
        let activation = activation
            .as_category()
            .and_then(|i| ActivationKind::ALL.get(i))
            .ok_or_else(invalid)?;
        Ok(Self {
            learning_rate: learning_rate.as_real().ok_or_else(invalid)?,
            num_dense_layers: layers.as_integer().ok_or_else(invalid)? as usize,
            num_dense_nodes: nodes.as_integer().ok_or_else(invalid)? as usize,
            activation: activation.clone(),
            eps_time: eps_time.as_real().ok_or_else(invalid)?,
        })
    }

    /// 基本設定にこのハイパーパラメータを適用します。
    pub fn apply(&self, base: &TrainingConfig) -> TrainingConfig {
        let model = base
            .model
            .clone()
            .with_num_dense_layers(self.num_dense_layers)
            .with_num_dense_nodes(self.num_dense_nodes)
            .with_activation(self.activation.clone());
        let mut config = base.clone();
        config.model = model;
        config
            .with_learning_rate(self.learning_rate)
            .with_eps_time(self.eps_time)
    }
}

/// 1回の評価。新しいモデルで学習し、検証損失の最小値を返します。
///
/// NaN/無限大の場合は [`NAN_PENALTY`] を返します。
pub fn fitness<B: AutodiffBackend>(
    base: &TrainingConfig,
    hyperparameters: &Hyperparameters,
    device: &B::Device,
) -> error::Result<f64> {
    let config = hyperparameters.apply(base);
    let mut data = TrainingData::new(&config)?;
    let mut trainer = Trainer::<B>::new(config, device.clone());
    let model = trainer.init_model();
    let outcome = trainer.fit(model, &mut data, None)?;

    if outcome.min_validation_loss.is_finite() {
        Ok(outcome.min_validation_loss)
    } else {
        warn!(
            first_non_finite_epoch = outcome.first_non_finite_epoch,
            "検証損失が有限値ではないためペナルティを返します"
        );
        Ok(NAN_PENALTY)
    }
}

/// 探索の設定。
#[derive(Config, Debug)]
pub struct SearchConfig {
    /// 目的関数の評価回数
    #[config(default = 50)]
    pub n_calls: usize,
    /// ランダムに選ぶ初期点の数
    #[config(default = 10)]
    pub n_initial_points: usize,
    #[config(default = 1234)]
    pub random_state: u64,
}

/// 探索を実行し、最良のハイパーパラメータと全評価履歴を返します。
pub fn search<B: AutodiffBackend>(
    base: &TrainingConfig,
    search: &SearchConfig,
    device: &B::Device,
    output: Option<&RunOutput>,
) -> error::Result<(Hyperparameters, OptimizationResult)> {
    let mut optimizer = BayesianOptimizer::new(Hyperparameters::space()?, search.random_state)
        .with_initial_points(search.n_initial_points);
    let mut log = output
        .map(|output| output.create_log(SEARCH_LOG_FILENAME))
        .transpose()?;
    let mut iteration = 0;

    let result = optimizer.minimize(
        |point| {
            let hyperparameters = Hyperparameters::from_point(point)?;
            info!(
                iteration,
                learning_rate = hyperparameters.learning_rate,
                num_dense_layers = hyperparameters.num_dense_layers,
                num_dense_nodes = hyperparameters.num_dense_nodes,
                activation = ?hyperparameters.activation,
                eps_time = hyperparameters.eps_time,
                "評価を開始します"
            );
            let started = Instant::now();
            let value = fitness::<B>(base, &hyperparameters, device)?;
            info!(iteration, value, "=> 評価時間: {:.2?}", started.elapsed());

            if let Some(log) = log.as_mut() {
                log.line(&format!(
                    "{iteration}\t{:.3e}\t{}\t{}\t{:?}\t{:.3e}\t{value:.10}",
                    hyperparameters.learning_rate,
                    hyperparameters.num_dense_layers,
                    hyperparameters.num_dense_nodes,
                    hyperparameters.activation,
                    hyperparameters.eps_time,
                ))?;
            }
            iteration += 1;
            Ok(value)
        },
        search.n_calls,
        Some(Hyperparameters::new().to_point()),
    )?;

    let best = Hyperparameters::from_point(&result.best.point)?;
    if let Some(output) = output {
        best.save(output.file(BEST_FILENAME))?;
        plot_convergence(&result, &output.file(CONVERGENCE_PLOT_FILENAME))?;
    }
    Ok((best, result))
}

/// 各評価時点までの最小値をグラフにします。
fn plot_convergence(result: &OptimizationResult, path: &Path) -> error::Result<()> {
    let convergence = result.convergence();
    let finite = convergence.iter().copied().filter(|v| v.is_finite());
    let min = finite.clone().fold(f64::INFINITY, f64::min);
    let max = finite.fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() {
        warn!("描画できる値がないため収束グラフを省略します");
        return Ok(());
    }
    let margin = ((max - min) * 0.1).max(1e-6);

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Convergence plot", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(1..convergence.len() + 1, (min - margin)..(max + margin))?;
    chart
        .configure_mesh()
        .x_desc("Number of calls")
        .y_desc("min f(x) after n calls")
        .draw()?;
    chart.draw_series(LineSeries::new(
        convergence.iter().enumerate().map(|(i, &v)| (i + 1, v)),
        &BLUE,
    ))?;
    chart.draw_series(
        convergence
            .iter()
            .enumerate()
            .map(|(i, &v)| Circle::new((i + 1, v), 3, BLUE.filled())),
    )?;
    root.present()?;
    Ok(())
}

/// `search`サブコマンドを実行します。
pub fn run(
    base: TrainingConfig,
    search_config: SearchConfig,
    output_dir: &Path,
) -> error::Result<()> {
    let device = Default::default();
    let output = RunOutput::create(output_dir)?;
    let (best, result) = search::<MyBackend>(&base, &search_config, &device, Some(&output))?;

    info!(
        best_value = result.best.value,
        learning_rate = best.learning_rate,
        num_dense_layers = best.num_dense_layers,
        num_dense_nodes = best.num_dense_nodes,
        activation = ?best.activation,
        eps_time = best.eps_time,
        "探索が完了しました"
    );
    info!(
        "=> 最良のハイパーパラメータを '{}' に保存しました。",
        output.file(BEST_FILENAME).display()
    );
    Ok(())
}
