use std::path::PathBuf;

use burn::config::Config;
use clap::{Args, Parser, Subcommand};

use crate::error::Result;
use crate::model::ModelConfig;
use crate::pinn::WaveProblem;
use crate::training::TrainingConfig;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Damped forced wave equation solved with a PINN on Burn",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train、search または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// PINNモデルを学習し、結果をファイルに保存します
    Train {
        #[command(flatten)]
        training: TrainingArgs,
    },
    /// ベイズ最適化でハイパーパラメータを探索します
    Search {
        #[command(flatten)]
        training: TrainingArgs,
        /// 目的関数の評価回数
        #[arg(long, default_value_t = 50)]
        n_calls: usize,
        /// ランダムに選ぶ初期点の数
        #[arg(long, default_value_t = 10)]
        initial_points: usize,
        /// 探索の乱数シード
        #[arg(long, default_value_t = 1234)]
        random_state: u64,
    },
    /// 保存されたPINNモデルを使い、推論を実行します
    Infer {
        /// `train` の出力ディレクトリ
        #[arg(short, long, default_value = "artifacts")]
        output: PathBuf,
    },
}

/// 学習設定を上書きする引数。指定しなかった項目は設定ファイルまたは既定値のままです。
#[derive(Args, Debug, Clone)]
pub struct TrainingArgs {
    /// 保存済みの学習設定 (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// 出力ディレクトリ
    #[arg(short, long, default_value = "artifacts")]
    pub output: PathBuf,
    #[arg(long)]
    pub epochs: Option<usize>,
    /// 検証用の点数
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// 学習用サンプラーのバッチサイズ（省略時は全点で1ステップ）
    #[arg(long)]
    pub sampler_batch_size: Option<usize>,
    #[arg(long)]
    pub learning_rate: Option<f64>,
    /// 時間因果性の強さ（0 以下で無効）
    #[arg(long, allow_negative_numbers = true)]
    pub eps_time: Option<f64>,
    #[arg(long)]
    pub domain_points: Option<usize>,
    #[arg(long)]
    pub ic_points: Option<usize>,
    #[arg(long)]
    pub period: Option<usize>,
    #[arg(long)]
    pub layers: Option<usize>,
    #[arg(long)]
    pub nodes: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainingArgs {
    /// 設定ファイル（なければ既定値）に引数を適用します。
    pub fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::new(ModelConfig::new(), WaveProblem::new()),
        };
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(sampler_batch_size) = self.sampler_batch_size {
            config.sampler_batch_size = Some(sampler_batch_size);
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(eps_time) = self.eps_time {
            config.eps_time = eps_time;
        }
        if let Some(n) = self.domain_points {
            config.num_domain_points = n;
        }
        if let Some(n) = self.ic_points {
            config.num_initial_points = n;
        }
        if let Some(period) = self.period {
            config.resample_period = period;
        }
        if let Some(layers) = self.layers {
            config.model.num_dense_layers = layers;
        }
        if let Some(nodes) = self.nodes {
            config.model.num_dense_nodes = nodes;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "damped-wave-pinn",
            "train",
            "--epochs",
            "5",
            "--eps-time",
            "-1",
            "--nodes",
            "20",
            "--sampler-batch-size",
            "256",
        ]);
        let Commands::Train { training } = cli.command else {
            panic!("expected train");
        };
        let config = training.training_config().unwrap();
        assert_eq!(config.num_epochs, 5);
        assert_eq!(config.causality(), None);
        assert_eq!(config.model.num_dense_nodes, 20);
        assert_eq!(config.batch_size, 512);
        assert_eq!(config.sampler_batch_size, Some(256));
        assert_eq!(training.output, PathBuf::from("artifacts"));
    }

    #[test]
    fn saved_config_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        TrainingConfig::new(ModelConfig::new(), WaveProblem::new())
            .with_batch_size(64)
            .save(&path)
            .unwrap();

        let cli = Cli::parse_from([
            "damped-wave-pinn",
            "search",
            "--config",
            path.to_str().unwrap(),
            "--n-calls",
            "3",
        ]);
        let Commands::Search {
            training, n_calls, ..
        } = cli.command
        else {
            panic!("expected search");
        };
        assert_eq!(n_calls, 3);
        assert_eq!(training.training_config().unwrap().batch_size, 64);
    }
}
