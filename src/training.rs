//! # 学習ループ
//!
//! サンプラーからバッチを取り出し、残差から損失を組み立て、Adam で1ステップずつ
//! パラメータを更新します。損失の履歴は [`Trainer`] が所有します。

use std::path::Path;
use std::time::Instant;

use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::ElementConversion;
use burn::tensor::backend::AutodiffBackend;
use plotters::prelude::*;
use tracing::{debug, info, warn};

use crate::artifacts::{
    CHECKPOINT_FILENAME, CONFIG_FILENAME, LOG_FILENAME, LOSS_PLOT_FILENAME, MODEL_FILENAME,
    OPTIMIZER_FILENAME, RunOutput,
};
use crate::dataset::{DomainSampler, InitialSampler, SamplerConfig};
use crate::error::{self, Error};
use crate::model::{ModelConfig, Pinn};
use crate::pinn::{InitialCondition, WaveProblem, total_loss};

type MyBackend = Autodiff<NdArray<f32>>;

/// 学習設定
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// ネットワークの構成
    pub model: ModelConfig,
    /// 解く方程式
    pub problem: WaveProblem,
    /// 学習率
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// 学習エポック数
    #[config(default = 2000)]
    pub num_epochs: usize,
    /// 検証用の固定点集合の点数
    #[config(default = 512)]
    pub batch_size: usize,
    /// 学習用サンプラーのバッチサイズ。`None` の場合は全点を1バッチとし、1エポック1ステップです
    pub sampler_batch_size: Option<usize>,
    /// 領域内部のコロケーション点数
    #[config(default = 10000)]
    pub num_domain_points: usize,
    /// 初期条件の点数
    #[config(default = 10000)]
    pub num_initial_points: usize,
    /// 点集合を入れ替えるまでのエポック数
    #[config(default = 3)]
    pub resample_period: usize,
    /// 時間因果性の重みの強さ。0 以下で無効
    #[config(default = 100.0)]
    pub eps_time: f64,
    /// 学習率を減衰させる間隔（エポック）
    #[config(default = 750)]
    pub lr_step_size: usize,
    /// 学習率の減衰率
    #[config(default = 0.1)]
    pub lr_gamma: f64,
    /// ログを記録するバッチ間隔
    #[config(default = 10)]
    pub log_interval: usize,
    #[config(default = 1234)]
    pub seed: u64,
    /// 初期変位 [m] をソフト制約としても課す場合の目標値
    pub initial_displacement: Option<f64>,
}

impl TrainingConfig {
    pub fn causality(&self) -> Option<f64> {
        (self.eps_time > 0.0).then_some(self.eps_time)
    }

    /// 課す初期条件。初速度ゼロは常に含みます（初期変位はハード制約が満たします）。
    pub fn initial_conditions(&self) -> Vec<InitialCondition> {
        let mut conditions = vec![InitialCondition::Velocity];
        if let Some(target) = self.initial_displacement {
            conditions.push(InitialCondition::Displacement { target });
        }
        conditions
    }
}

/// チェックポイントのメタデータ。
#[derive(Config, Debug)]
pub struct CheckpointInfo {
    pub epoch: usize,
    pub loss: f64,
}

/// 学習に使う4つのサンプラー。
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub domain: DomainSampler,
    pub initial: InitialSampler,
    /// 固定の検証用点集合（シャッフルなし）
    pub validation_domain: DomainSampler,
    pub validation_initial: InitialSampler,
}

impl TrainingData {
    pub fn new(config: &TrainingConfig) -> error::Result<Self> {
        let dims = config.model.num_inputs;
        if dims < 2 {
            return Err(Error::Domain(format!(
                "at least one space axis and a time axis are required, got {dims} inputs"
            )));
        }
        let model = &config.model;
        if model.num_dense_layers == 0 || model.num_dense_nodes == 0 {
            return Err(Error::Domain(format!(
                "the network needs at least one hidden layer and node, got {} x {}",
                model.num_dense_layers, model.num_dense_nodes
            )));
        }
        let space = dims - 1;
        let validation_seed = config.seed.wrapping_add(1);

        Ok(Self {
            domain: SamplerConfig::new(
                vec![0.0; dims],
                vec![1.0; dims],
                config.num_domain_points,
            )
            .with_batch_size(config.sampler_batch_size)
            .with_period(config.resample_period)
            .with_seed(config.seed)
            .init_domain()?,
            initial: SamplerConfig::new(
                vec![0.0; space],
                vec![1.0; space],
                config.num_initial_points,
            )
            .with_batch_size(config.sampler_batch_size)
            .with_period(config.resample_period)
            .with_seed(config.seed)
            .init_initial()?,
            validation_domain: SamplerConfig::new(
                vec![0.0; dims],
                vec![1.0; dims],
                config.batch_size,
            )
            .with_shuffle(false)
            .with_seed(validation_seed)
            .init_domain()?,
            validation_initial: SamplerConfig::new(
                vec![0.0; space],
                vec![1.0; space],
                config.batch_size,
            )
            .with_shuffle(false)
            .with_seed(validation_seed)
            .init_initial()?,
        })
    }
}

/// 記録した損失の履歴。追記のみ。
#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    values: Vec<f64>,
}

impl LossHistory {
    pub fn push(&mut self, loss: f64) {
        self.values.push(loss);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 有限値のうちの最小値。
    pub fn min(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .min_by(f64::total_cmp)
    }

    /// 学習過程の損失をグラフとしてPNGファイルに出力します。
    pub fn plot(&self, path: &Path) -> error::Result<()> {
        let points = self
            .values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite() && **v > 0.0)
            .map(|(i, v)| (i, v.log10()))
            .collect::<Vec<_>>();
        if points.is_empty() {
            warn!("描画できる損失がないためグラフを省略します");
            return Ok(());
        }
        let min_log_loss = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min) - 0.5;
        let max_log_loss = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max) + 0.5;

        let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
        root.fill(&WHITE)?;
        let mut chart = ChartBuilder::on(&root)
            .caption("Training Loss", ("sans-serif", 40).into_font())
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(50)
            .build_cartesian_2d(0..self.values.len(), min_log_loss..max_log_loss)?;
        chart
            .configure_mesh()
            .y_desc("Loss (log10 scale)")
            .x_desc("Iterations")
            .draw()?;
        chart.draw_series(LineSeries::new(points, &RED))?;
        root.present()?;
        Ok(())
    }
}

/// エポック単位の段階的な学習率減衰 `lr · gamma^(epoch / step_size)`。
#[derive(Debug, Clone, Copy)]
pub struct StepDecay {
    initial: f64,
    step_size: usize,
    gamma: f64,
}

impl StepDecay {
    pub fn new(initial: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            initial,
            step_size,
            gamma,
        }
    }

    pub fn learning_rate(&self, epoch: usize) -> f64 {
        if self.step_size == 0 {
            return self.initial;
        }
        self.initial * self.gamma.powi((epoch / self.step_size) as i32)
    }
}

/// 学習ループの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Training { epoch: usize, batch: usize },
    Checkpointed,
    Done,
}

/// 学習の結果。
#[derive(Debug)]
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: Pinn<B>,
    /// エポックごとの検証損失の最小値（全て NaN の場合は NaN）
    pub min_validation_loss: f64,
    /// 最後のステップの損失
    pub last_loss: f64,
    pub epochs: usize,
    /// 初めて損失が有限値でなくなったエポック
    pub first_non_finite_epoch: Option<usize>,
}

/// 学習ループを駆動します。
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    conditions: Vec<InitialCondition>,
    device: B::Device,
    history: LossHistory,
    validation: LossHistory,
    phase: Phase,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self {
            conditions: config.initial_conditions(),
            config,
            device,
            history: LossHistory::default(),
            validation: LossHistory::default(),
            phase: Phase::Uninitialized,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// エポックごとの検証損失。
    pub fn validation_history(&self) -> &LossHistory {
        &self.validation
    }

    /// 設定に従ってハード制約付きのモデルを初期化します。
    pub fn init_model(&self) -> Pinn<B> {
        self.config
            .model
            .init(Some(self.config.problem.hard_constraint()), &self.device)
    }

    /// 設定したエポック数だけ学習します。
    ///
    /// 損失が NaN になっても中断しません。最初に発生したエポックを結果に残し、警告を出します。
    /// `output` を指定した場合はログ・チェックポイント・損失グラフを書き出します。
    pub fn fit(
        &mut self,
        mut model: Pinn<B>,
        data: &mut TrainingData,
        output: Option<&RunOutput>,
    ) -> error::Result<TrainingOutcome<B>> {
        let config = self.config.clone();
        let mut optim = AdamConfig::new().init::<B, Pinn<B>>();
        let schedule = StepDecay::new(config.learning_rate, config.lr_step_size, config.lr_gamma);
        let eps_time = config.causality();
        let batches = data.domain.len();
        let log_interval = config.log_interval.max(1);

        let mut log = match output {
            Some(output) => {
                config.save(output.file(CONFIG_FILENAME))?;
                Some(output.create_log(LOG_FILENAME)?)
            }
            None => None,
        };

        let mut last_loss = f64::NAN;
        let mut first_non_finite_epoch = None;
        let training_start = Instant::now();

        info!(
            epochs = config.num_epochs,
            batches,
            "学習を開始します (減衰付き波動方程式)"
        );

        // --- 学習ループ ---
        for epoch in 0..config.num_epochs {
            let learning_rate = schedule.learning_rate(epoch);
            for batch in 0..batches {
                self.phase = Phase::Training { epoch, batch };
                let domain = data.domain.next_batch().to_tensor::<B>(&self.device);
                let initial = data.initial.next_batch().to_tensor::<B>(&self.device);
                let loss = total_loss(
                    &model,
                    &config.problem,
                    &self.conditions,
                    domain,
                    initial,
                    eps_time,
                );

                last_loss = loss.clone().into_scalar().elem::<f64>();
                if !last_loss.is_finite() && first_non_finite_epoch.is_none() {
                    warn!(epoch, batch, "損失が有限値ではありません。学習は継続します");
                    first_non_finite_epoch = Some(epoch);
                }

                if batch % log_interval == 0 {
                    let line = format!(
                        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.10}",
                        epoch,
                        batch,
                        batches,
                        100.0 * batch as f64 / batches as f64,
                        last_loss
                    );
                    info!("{line}");
                    if let Some(log) = log.as_mut() {
                        log.line(&line)?;
                    }
                    self.history.push(last_loss);
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(learning_rate, model, grads);
            }

            let validation_loss = self.validation_loss(&model.valid(), data);
            debug!(epoch, validation_loss, learning_rate, "エポック終了");
            self.validation.push(validation_loss);
        }
        info!(
            "学習が完了しました。 => 学習時間: {:.2?}",
            training_start.elapsed()
        );

        // --- 結果の保存と描画 ---
        if let Some(output) = output {
            let last_epoch = config.num_epochs.saturating_sub(1);
            self.save_checkpoint(output, &model, &optim, last_epoch, last_loss)?;
            self.phase = Phase::Checkpointed;
            info!(
                "=> モデルを '{}' に保存しました。",
                output.model_file(MODEL_FILENAME).display()
            );
            // 描画の失敗では学習結果を捨てない
            match self.history.plot(&output.file(LOSS_PLOT_FILENAME)) {
                Ok(()) => info!(
                    "=> 損失グラフを '{}' に保存しました。",
                    output.file(LOSS_PLOT_FILENAME).display()
                ),
                Err(err) => warn!(%err, "損失グラフを描画できませんでした"),
            }
        }
        self.phase = Phase::Done;

        Ok(TrainingOutcome {
            model,
            min_validation_loss: self.validation.min().unwrap_or(f64::NAN),
            last_loss,
            epochs: config.num_epochs,
            first_non_finite_epoch,
        })
    }

    /// 固定の検証用点集合での損失。自動微分なしのバックエンドで評価します。
    fn validation_loss(&self, model: &Pinn<B::InnerBackend>, data: &mut TrainingData) -> f64 {
        let domain = data
            .validation_domain
            .next_batch()
            .to_tensor::<B::InnerBackend>(&self.device);
        let initial = data
            .validation_initial
            .next_batch()
            .to_tensor::<B::InnerBackend>(&self.device);
        total_loss(
            model,
            &self.config.problem,
            &self.conditions,
            domain,
            initial,
            self.config.causality(),
        )
        .into_scalar()
        .elem::<f64>()
    }

    fn save_checkpoint<O: Optimizer<Pinn<B>, B>>(
        &self,
        output: &RunOutput,
        model: &Pinn<B>,
        optim: &O,
        epoch: usize,
        loss: f64,
    ) -> error::Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(output.model_file(MODEL_FILENAME), &recorder)?;
        Recorder::<B>::record(
            &recorder,
            optim.to_record(),
            output.model_file(OPTIMIZER_FILENAME),
        )?;
        CheckpointInfo::new(epoch, loss).save(output.model_file(CHECKPOINT_FILENAME))?;
        Ok(())
    }
}

/// `train`サブコマンドを実行します。
pub fn run(config: TrainingConfig, output_dir: &Path) -> error::Result<()> {
    let device = Default::default();
    let output = RunOutput::create(output_dir)?;
    let mut data = TrainingData::new(&config)?;

    let mut trainer = Trainer::<MyBackend>::new(config, device);
    let model = trainer.init_model();
    let outcome = trainer.fit(model, &mut data, Some(&output))?;

    info!(
        min_validation_loss = outcome.min_validation_loss,
        last_loss = outcome.last_loss,
        logged_steps = trainer.history().len(),
        "学習結果"
    );
    if let Some(epoch) = outcome.first_non_finite_epoch {
        warn!(epoch, "学習中に NaN/無限大の損失が発生しました");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_drops_every_step_size_epochs() {
        let schedule = StepDecay::new(1e-2, 750, 0.1);
        assert_eq!(schedule.learning_rate(0), 1e-2);
        assert_eq!(schedule.learning_rate(749), 1e-2);
        assert!((schedule.learning_rate(750) - 1e-3).abs() < 1e-15);
        assert!((schedule.learning_rate(1500) - 1e-4).abs() < 1e-15);
        assert_eq!(StepDecay::new(0.5, 0, 0.1).learning_rate(10_000), 0.5);
    }

    #[test]
    fn history_min_ignores_non_finite_values() {
        let mut history = LossHistory::default();
        assert_eq!(history.min(), None);
        history.push(f64::NAN);
        history.push(0.3);
        history.push(0.1);
        history.push(f64::INFINITY);
        assert_eq!(history.len(), 4);
        assert_eq!(history.min(), Some(0.1));
    }

    #[test]
    fn default_training_sets_are_one_step_per_epoch() {
        let config = TrainingConfig::new(ModelConfig::new(), WaveProblem::new());
        let mut data = TrainingData::new(&config).unwrap();
        assert_eq!(data.domain.len(), 1);
        assert_eq!(data.initial.len(), 1);
        assert_eq!(data.domain.next_batch().rows(), 10000);
        assert_eq!(data.validation_domain.next_batch().rows(), 512);
    }

    #[test]
    fn empty_networks_are_rejected() {
        let layers = TrainingConfig::new(
            ModelConfig::new().with_num_dense_layers(0),
            WaveProblem::new(),
        );
        assert!(matches!(TrainingData::new(&layers), Err(Error::Domain(_))));

        let nodes = TrainingConfig::new(
            ModelConfig::new().with_num_dense_nodes(0),
            WaveProblem::new(),
        );
        assert!(matches!(TrainingData::new(&nodes), Err(Error::Domain(_))));
    }

    #[test]
    fn initial_displacement_adds_a_soft_condition() {
        let config = TrainingConfig::new(ModelConfig::new(), WaveProblem::new());
        assert_eq!(config.initial_conditions(), vec![InitialCondition::Velocity]);

        let config = config.with_initial_displacement(Some(-0.1));
        assert_eq!(
            config.initial_conditions(),
            vec![
                InitialCondition::Velocity,
                InitialCondition::Displacement { target: -0.1 }
            ]
        );
    }

    #[test]
    fn training_data_shapes_follow_config() {
        let config = TrainingConfig::new(ModelConfig::new(), WaveProblem::new())
            .with_sampler_batch_size(Some(16))
            .with_batch_size(16)
            .with_num_domain_points(40)
            .with_num_initial_points(20);
        let mut data = TrainingData::new(&config).unwrap();
        assert_eq!(data.domain.len(), 3);
        assert_eq!(data.initial.len(), 2);
        assert_eq!(data.validation_domain.len(), 1);

        let batch = data.initial.next_batch();
        assert_eq!((batch.rows(), batch.dims()), (16, 2));
        assert_eq!(data.validation_domain.next_batch().rows(), 16);
    }

    #[test]
    fn causality_is_disabled_by_non_positive_epsilon() {
        let config = TrainingConfig::new(ModelConfig::new(), WaveProblem::new());
        assert_eq!(config.causality(), Some(100.0));
        assert_eq!(config.with_eps_time(0.0).causality(), None);
    }
}
