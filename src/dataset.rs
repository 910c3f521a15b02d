//! # コロケーション点のサンプラー
//!
//! 超直方体 `[xmin, xmax]` 上の一様乱数点をバッチ単位で生成します。
//! 二段構えの乱数生成器（マスター系列と描画系列）を持ち、`period` エポックの間は
//! 同じ点集合を繰り返し、周期を越えるとマスター系列から新しいシードを引いて
//! 点集合を入れ替えます。
//!
//! 行の後処理は [`RowTransform`] として差し込みます。
//! 領域用は時間軸（最後の軸）を昇順に並べ替え、初期条件用は時刻 0 の列を末尾に追加します。

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{self, Error};

/// マスター系列から引くシードの上限（排他的）。
const SEED_RANGE: u64 = 10_000;

/// 1バッチ分の点集合。行優先で `rows × dims` の値を保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    data: Vec<f32>,
    rows: usize,
    dims: usize,
}

impl Sample {
    /// 軸ごとの列ベクトルから行優先のバッチを組み立てます。
    fn from_columns(columns: &[Vec<f32>], rows: usize) -> Self {
        let dims = columns.len();
        let mut data = Vec::with_capacity(rows * dims);
        for row in 0..rows {
            for column in columns {
                data.push(column[row]);
            }
        }
        Self { data, rows, dims }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dims..(index + 1) * self.dims]
    }

    /// 指定した軸の値を行順に取り出します。
    pub fn column(&self, axis: usize) -> Vec<f32> {
        (0..self.rows).map(|row| self.data[row * self.dims + axis]).collect()
    }

    /// `[rows, dims]` 形状のテンソルに変換します。
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(self.data.clone(), [self.rows, self.dims]),
            device,
        )
    }
}

/// サンプリング後の列に適用する後処理。
pub trait RowTransform {
    /// 描画した列（軸ごと）を書き換えます。列の追加も許されます。
    fn apply(&self, columns: &mut Vec<Vec<f32>>, rows: usize);
}

/// 最後の軸（時間）をバッチ内で昇順に並べ替えます。
///
/// 時間因果性の重み付けはバッチが時刻順に並んでいることを前提にしています。
#[derive(Debug, Clone, Copy, Default)]
pub struct SortLastAxis;

impl RowTransform for SortLastAxis {
    fn apply(&self, columns: &mut Vec<Vec<f32>>, _rows: usize) {
        if let Some(last) = columns.last_mut() {
            last.sort_by(f32::total_cmp);
        }
    }
}

/// 末尾に値 0 の時間軸を追加し、初期条件（時刻 0）の点に固定します。
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendZeroAxis;

impl RowTransform for AppendZeroAxis {
    fn apply(&self, columns: &mut Vec<Vec<f32>>, rows: usize) {
        columns.push(vec![0.0; rows]);
    }
}

/// サンプラーの設定。
#[derive(Config, Debug)]
pub struct SamplerConfig {
    /// 各軸の最小値
    pub xmin: Vec<f32>,
    /// 各軸の最大値（この値も含めてサンプリングします）
    pub xmax: Vec<f32>,
    /// 1エポックあたりの総点数
    pub n: usize,
    /// バッチサイズ。`None` の場合は `n` 点を1バッチで返します
    pub batch_size: Option<usize>,
    /// `false` の場合は点集合を一切入れ替えません（検証用の固定集合）
    #[config(default = true)]
    pub shuffle: bool,
    /// 点集合を使い回すエポック数
    #[config(default = 1)]
    pub period: usize,
    /// マスター系列のシード
    #[config(default = 1234)]
    pub seed: u64,
}

impl SamplerConfig {
    /// 領域内部用のサンプラー（時間軸を昇順に整列）を作ります。
    pub fn init_domain(&self) -> error::Result<DomainSampler> {
        Sampler::new(self, SortLastAxis)
    }

    /// 初期条件用のサンプラー（時刻 0 の列を追加）を作ります。
    pub fn init_initial(&self) -> error::Result<InitialSampler> {
        Sampler::new(self, AppendZeroAxis)
    }
}

pub type DomainSampler = Sampler<SortLastAxis>;
pub type InitialSampler = Sampler<AppendZeroAxis>;

/// 周期的にシードを入れ替える決定的なサンプラー。
///
/// `next_batch` は逐次呼び出しを前提とします。
#[derive(Debug, Clone)]
pub struct Sampler<T: RowTransform> {
    axes: Vec<Uniform<f32>>,
    n: usize,
    batch_size: usize,
    shuffle: bool,
    period: usize,
    initial_seed: u64,
    master: StdRng,
    current: StdRng,
    seed: u64,
    counter: usize,
    period_counter: usize,
    transform: T,
}

impl<T: RowTransform> Sampler<T> {
    pub fn new(config: &SamplerConfig, transform: T) -> error::Result<Self> {
        if config.xmin.len() != config.xmax.len() {
            return Err(Error::Domain(format!(
                "xmin has {} axes but xmax has {}",
                config.xmin.len(),
                config.xmax.len()
            )));
        }
        if config.n == 0 {
            return Err(Error::Domain("n must be positive".to_string()));
        }
        if config.period == 0 {
            return Err(Error::Domain("period must be positive".to_string()));
        }
        let batch_size = config.batch_size.unwrap_or(config.n);
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be positive".to_string()));
        }

        let axes = config
            .xmin
            .iter()
            .zip(&config.xmax)
            .map(|(&low, &high)| Uniform::new_inclusive(low, high))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut master = StdRng::seed_from_u64(config.seed);
        let seed = master.random_range(0..SEED_RANGE);
        Ok(Self {
            axes,
            n: config.n,
            batch_size,
            shuffle: config.shuffle,
            period: config.period,
            initial_seed: config.seed,
            master,
            current: StdRng::seed_from_u64(seed),
            seed,
            counter: 0,
            period_counter: 0,
            transform,
        })
    }

    /// 1エポックあたりのバッチ数。
    pub fn len(&self) -> usize {
        if self.batch_size == self.n {
            1
        } else {
            self.n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// 現在の描画系列のシード。
    pub fn current_seed(&self) -> u64 {
        self.seed
    }

    /// 次のバッチを生成します。
    pub fn next_batch(&mut self) -> Sample {
        if self.counter >= self.n {
            // 同じシードで描画系列を巻き戻す
            self.current = StdRng::seed_from_u64(self.seed);
            self.counter = 0;
            if self.shuffle {
                self.period_counter += 1;
            }
        }
        if self.shuffle && self.period_counter >= self.period {
            self.seed = self.master.random_range(0..SEED_RANGE);
            self.current = StdRng::seed_from_u64(self.seed);
            self.counter = 0;
            self.period_counter = 0;
        }

        let length = self.batch_size.min(self.n - self.counter);
        let mut columns = self
            .axes
            .iter()
            .map(|axis| {
                (0..length)
                    .map(|_| axis.sample(&mut self.current))
                    .collect::<Vec<f32>>()
            })
            .collect::<Vec<_>>();
        self.transform.apply(&mut columns, length);
        self.counter += length;

        Sample::from_columns(&columns, length)
    }

    /// 構築直後の状態に戻します。マスター系列も最初からやり直します。
    pub fn reset(&mut self) {
        self.master = StdRng::seed_from_u64(self.initial_seed);
        self.seed = self.master.random_range(0..SEED_RANGE);
        self.current = StdRng::seed_from_u64(self.seed);
        self.counter = 0;
        self.period_counter = 0;
    }
}
