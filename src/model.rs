use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::{sigmoid, silu};

use crate::gradient::{Jet, JetModule};

/// 隠れ層の活性化関数。
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ActivationKind {
    Tanh,
    Sin,
    Sigmoid,
    Silu,
}

impl ActivationKind {
    /// 探索空間のカテゴリ順。
    pub const ALL: [ActivationKind; 4] = [
        ActivationKind::Sin,
        ActivationKind::Sigmoid,
        ActivationKind::Tanh,
        ActivationKind::Silu,
    ];

    fn apply<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Sin => x.sin(),
            ActivationKind::Sigmoid => sigmoid(x),
            ActivationKind::Silu => silu(x),
        }
    }

    fn apply_jet<B: Backend>(&self, jet: Jet<B>) -> Jet<B> {
        match self {
            ActivationKind::Tanh => jet.tanh(),
            ActivationKind::Sin => jet.sin(),
            ActivationKind::Sigmoid => jet.sigmoid(),
            ActivationKind::Silu => jet.silu(),
        }
    }
}

/// 出力に掛けるハード制約。
///
/// `U = scale · (X - 1) · X · τ · (y + offset) - offset`
///
/// `X = 0`、`X = 1`、`τ = 0` のいずれでも `U = -offset` が厳密に成り立ちます。
/// `X` は最初の軸、`τ` は最後の軸です。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardConstraint {
    pub scale: f64,
    pub offset: f64,
}

impl HardConstraint {
    fn apply<B: Backend>(&self, input: Tensor<B, 2>, output: Tensor<B, 2>) -> Tensor<B, 2> {
        let [rows, dims] = input.dims();
        let x = input.clone().slice([0..rows, 0..1]);
        let tau = input.slice([0..rows, dims - 1..dims]);
        let envelope = (x.clone().sub_scalar(1.0) * x * tau).mul_scalar(self.scale);
        (envelope * output.add_scalar(self.offset)).sub_scalar(self.offset)
    }

    fn apply_jet<B: Backend>(&self, input: &Jet<B>, output: Jet<B>) -> Jet<B> {
        let dims = input.value.dims()[1];
        let x = input.column(0);
        let tau = input.column(dims - 1);
        let envelope = x.clone().add_scalar(-1.0).mul(x).mul(tau).mul_scalar(self.scale);
        envelope
            .mul(output.add_scalar(self.offset))
            .add_scalar(-self.offset)
    }
}

/// PINNモデルの設定。
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力次元（空間 + 時間）
    #[config(default = 2)]
    pub num_inputs: usize,
    /// 隠れ層の数
    #[config(default = 3)]
    pub num_dense_layers: usize,
    /// 隠れ層の幅
    #[config(default = 100)]
    pub num_dense_nodes: usize,
    #[config(default = "ActivationKind::Tanh")]
    pub activation: ActivationKind,
}

impl ModelConfig {
    /// 新しいモデルを初期化します。重みは Xavier 一様分布で初期化します。
    pub fn init<B: Backend>(
        &self,
        constraint: Option<HardConstraint>,
        device: &B::Device,
    ) -> Pinn<B> {
        let layer = |d_input: usize, d_output: usize| {
            LinearConfig::new(d_input, d_output)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device)
        };
        let width = self.num_dense_nodes;
        let mut linears = Vec::with_capacity(self.num_dense_layers + 1);
        linears.push(layer(self.num_inputs, width));
        for _ in 1..self.num_dense_layers {
            linears.push(layer(width, width));
        }
        linears.push(layer(width, 1));

        Pinn {
            linears,
            activation: Ignored(self.activation.clone()),
            constraint: Ignored(constraint),
        }
    }
}

/// PINNの本体となるニューラルネットワークモデル。
///
/// 正規化座標 `(X, τ)` を入力とし、正規化変位 `U` を予測する多層パーセプトロン（MLP）です。
/// ハード制約が設定されている場合は出力をその変換に通します。
#[derive(Module, Debug)]
pub struct Pinn<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Ignored<ActivationKind>,
    constraint: Ignored<Option<HardConstraint>>,
}

impl<B: Backend> Pinn<B> {
    /// モデルの順伝播を実行します。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let (last, hidden) = self.split_layers();
        let mut x = input.clone();
        for linear in hidden {
            x = self.activation.0.apply(linear.forward(x));
        }
        let y = last.forward(x);
        match self.constraint.0 {
            Some(constraint) => constraint.apply(input, y),
            None => y,
        }
    }

    pub fn num_dense_layers(&self) -> usize {
        self.linears.len() - 1
    }

    pub fn activation(&self) -> &ActivationKind {
        &self.activation.0
    }

    fn split_layers(&self) -> (&Linear<B>, &[Linear<B>]) {
        self.linears
            .split_last()
            .expect("a model always has an output layer")
    }
}

impl<B: Backend> JetModule<B> for Pinn<B> {
    fn forward_jet(&self, input: Jet<B>) -> Jet<B> {
        let (last, hidden) = self.split_layers();
        let mut x = input.clone();
        for linear in hidden {
            x = self.activation.0.apply_jet(x.linear(linear));
        }
        let y = x.linear(last);
        match self.constraint.0 {
            Some(constraint) => constraint.apply_jet(&input, y),
            None => y,
        }
    }
}
