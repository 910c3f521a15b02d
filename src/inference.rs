use std::path::Path;
use std::time::Instant;

use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use plotters::prelude::*;
use tracing::info;

use crate::artifacts::{CONFIG_FILENAME, MODEL_FILENAME, RunOutput};
use crate::error::{Error, Result};
use crate::model::Pinn;
use crate::training::TrainingConfig;

type MyBackend = NdArray<f32>;

/// 予測グラフのファイル名
pub const PREDICTION_PLOT_FILENAME: &str = "prediction.png";

/// 空間方向の評価点数
const NUM_X: usize = 101;
/// 評価する時刻の数（τ = 0, 0.2, ..., 1）
const NUM_SLICES: usize = 6;

/// 1つの時刻での物理変位の分布。
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// 正規化時刻 τ
    pub tau: f64,
    /// `(x [m], u [m])` の組
    pub points: Vec<(f64, f64)>,
}

/// 保存済みの設定とモデルを読み込みます。
pub fn load<B: Backend>(
    output: &RunOutput,
    device: &B::Device,
) -> Result<(TrainingConfig, Pinn<B>)> {
    let config_path = output.file(CONFIG_FILENAME);
    if !config_path.exists() {
        return Err(Error::MissingModel(config_path));
    }
    // レコーダーが拡張子 .mpk を付けます
    let model_path = output.model_file(MODEL_FILENAME);
    if !model_path.with_extension("mpk").exists() {
        return Err(Error::MissingModel(model_path.with_extension("mpk")));
    }

    let config = TrainingConfig::load(&config_path)?;
    let model = config
        .model
        .init::<B>(Some(config.problem.hard_constraint()), device)
        .load_file(
            model_path,
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )?;
    Ok((config, model))
}

/// 格子点上でモデルを評価し、時刻ごとの物理変位を返します。
///
/// 空間が2次元以上の場合、最初の軸以外の空間座標は 0.5 に固定します。
pub fn predict<B: Backend>(
    model: &Pinn<B>,
    config: &TrainingConfig,
    device: &B::Device,
) -> Vec<Snapshot> {
    let problem = &config.problem;
    let dims = config.model.num_inputs;
    let xs = (0..NUM_X)
        .map(|i| i as f64 / (NUM_X - 1) as f64)
        .collect::<Vec<_>>();

    (0..NUM_SLICES)
        .map(|slice| {
            let tau = slice as f64 / (NUM_SLICES - 1) as f64;
            let mut coords = Vec::with_capacity(NUM_X * dims);
            for x in &xs {
                coords.push(*x as f32);
                coords.extend(std::iter::repeat_n(0.5f32, dims.saturating_sub(2)));
                coords.push(tau as f32);
            }
            let input =
                Tensor::<B, 2>::from_data(TensorData::new(coords, [NUM_X, dims]), device);
            let displacement = problem.to_physical(model.forward(input));
            let points = xs
                .iter()
                .zip(displacement.into_data().iter::<f64>())
                .map(|(x, u)| (x * problem.delta_x() + problem.x_min, u))
                .collect();
            Snapshot { tau, points }
        })
        .collect()
}

/// 時刻ごとの変位を1枚のグラフに描画します。
pub fn plot(snapshots: &[Snapshot], config: &TrainingConfig, path: &Path) -> Result<()> {
    let problem = &config.problem;
    let (u_low, u_high) = snapshots
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.1))
        .filter(|u| u.is_finite())
        .fold((problem.u_min, problem.u_max), |(lo, hi), u| {
            (lo.min(u), hi.max(u))
        });
    let margin = ((u_high - u_low) * 0.05).max(1e-3);

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Displacement of the string", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(
            problem.x_min..problem.x_max,
            (u_low - margin)..(u_high + margin),
        )?;
    chart.configure_mesh().x_desc("x [m]").y_desc("u [m]").draw()?;

    for (i, snapshot) in snapshots.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        let t = snapshot.tau * problem.t_f;
        chart
            .draw_series(LineSeries::new(
                snapshot.points.iter().copied(),
                color.stroke_width(2),
            ))?
            .label(format!("t = {t:.1} s"))
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// `infer`サブコマンドを実行します。
pub fn run(output_dir: &Path) -> Result<()> {
    let device = Default::default();
    let output = RunOutput::open(output_dir);

    info!("推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();
    let (config, model) = load::<MyBackend>(&output, &device)?;
    info!(
        layers = model.num_dense_layers(),
        activation = ?model.activation(),
        "保存済みモデルを '{}' からロードしました",
        output.root().display()
    );

    let snapshots = predict(&model, &config, &device);
    for snapshot in &snapshots {
        let (min, max) = snapshot
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.1), hi.max(p.1))
            });
        info!(
            tau = snapshot.tau,
            u_min = min,
            u_max = max,
            "変位の範囲 [m]"
        );
    }
    info!("=> 推論時間: {:.2?}", inference_start.elapsed());

    let path = output.file(PREDICTION_PLOT_FILENAME);
    plot(&snapshots, &config, &path)?;
    info!("=> 予測グラフを '{}' に保存しました。", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use crate::pinn::WaveProblem;

    #[test]
    fn missing_artifacts_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let output = RunOutput::open(dir.path());
        let err = load::<MyBackend>(&output, &Default::default()).unwrap_err();
        assert!(matches!(err, Error::MissingModel(_)));
    }

    #[test]
    fn constrained_prediction_starts_from_rest() {
        let device = Default::default();
        let config = TrainingConfig::new(
            ModelConfig::new().with_num_dense_nodes(8),
            WaveProblem::new(),
        );
        let model = config
            .model
            .init::<MyBackend>(Some(config.problem.hard_constraint()), &device);
        let snapshots = predict(&model, &config, &device);

        assert_eq!(snapshots.len(), NUM_SLICES);
        assert!(snapshots.iter().all(|s| s.points.len() == NUM_X));
        // τ = 0 では変位が u_max に固定されます
        for (_, u) in &snapshots[0].points {
            assert!((u - config.problem.u_max).abs() < 1e-5);
        }
        // 両端も固定
        for snapshot in &snapshots {
            assert!((snapshot.points[0].1 - config.problem.u_max).abs() < 1e-5);
            assert!((snapshot.points[NUM_X - 1].1 - config.problem.u_max).abs() < 1e-5);
        }
    }
}
