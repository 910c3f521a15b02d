use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// 学習ログのファイル名
pub const LOG_FILENAME: &str = "train.txt";
/// 学習設定のファイル名
pub const CONFIG_FILENAME: &str = "config.json";
/// 損失グラフのファイル名
pub const LOSS_PLOT_FILENAME: &str = "training_loss.png";
/// モデルを保存するファイル名（拡張子はレコーダーが付けます）
pub const MODEL_FILENAME: &str = "model";
/// オプティマイザの状態を保存するファイル名
pub const OPTIMIZER_FILENAME: &str = "optimizer";
/// チェックポイントのメタデータ
pub const CHECKPOINT_FILENAME: &str = "checkpoint.json";

/// 1回の実行の出力先ディレクトリ。
///
/// ```text
/// <root>/
/// ├── config.json
/// ├── train.txt
/// ├── training_loss.png
/// └── model/
///     ├── model.mpk
///     ├── optimizer.mpk
///     └── checkpoint.json
/// ```
#[derive(Debug, Clone)]
pub struct RunOutput {
    root: PathBuf,
}

impl RunOutput {
    /// ディレクトリを作成します（既に存在していても構いません）。
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("model"))?;
        Ok(Self { root })
    }

    /// 既存のディレクトリを開きます。ディレクトリは作成しません。
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn model_file(&self, name: &str) -> PathBuf {
        self.root.join("model").join(name)
    }

    /// 追記専用のテキストログを作成します。既存のファイルは切り詰めます。
    pub fn create_log(&self, name: &str) -> Result<TextLog> {
        let file = File::create(self.file(name))?;
        Ok(TextLog {
            writer: BufWriter::new(file),
        })
    }
}

/// 1行ずつ書き込むプレーンテキストのログ。
#[derive(Debug)]
pub struct TextLog {
    writer: BufWriter<File>,
}

impl TextLog {
    pub fn line(&mut self, line: &str) -> Result<()> {
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}
