//! # 減衰・外力付き波動方程式の PINN
//!
//! `clap` クレートを利用して、コマンドラインから`train`（学習）、`search`（探索）、
//! `infer`（推論）の機能を個別に実行できます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --output artifacts
//! ```
//!
//! ### ハイパーパラメータ探索
//! ```bash
//! cargo run --release -- search --n-calls 50 --output search
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer --output artifacts
//! ```
//!
//! ログの詳細度は `RUST_LOG` で変更できます（既定は `info`）。

use clap::Parser;
use damped_wave_pinn::cli::{Cli, Commands};
use damped_wave_pinn::search::SearchConfig;
use damped_wave_pinn::{inference, search, training};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { training: args } => {
            let config = args.training_config()?;
            training::run(config, &args.output)?;
        }
        Commands::Search {
            training: args,
            n_calls,
            initial_points,
            random_state,
        } => {
            let config = args.training_config()?;
            let search_config = SearchConfig::new()
                .with_n_calls(n_calls)
                .with_n_initial_points(initial_points)
                .with_random_state(random_state);
            search::run(config, search_config, &args.output)?;
        }
        Commands::Infer { output } => {
            inference::run(&output)?;
        }
    }

    Ok(())
}
