//! # 入力に関する厳密な微分
//!
//! `burn` の自動微分は逆モードのみで、勾配をもう一度微分することはできません。
//! そこで入力方向 `v` に沿った2次のテイラージェット `(f, D_v f, D_v² f)` を
//! 通常のテンソル演算で順方向に伝播させます。各演算は逆モードのテープにも
//! 記録されるので、得られた微分量から作った損失はネットワークのパラメータについて
//! そのまま逆伝播できます。差分近似は一切使いません。

use burn::nn::Linear;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

/// 方向 `v` に沿った2次のテイラージェット。
///
/// いずれも `[バッチ数, 特徴数]` の形状を持ちます。
#[derive(Debug, Clone)]
pub struct Jet<B: Backend> {
    /// 関数値 `f`
    pub value: Tensor<B, 2>,
    /// 1階方向微分 `D_v f`
    pub tangent: Tensor<B, 2>,
    /// 2階方向微分 `D_v² f`
    pub curvature: Tensor<B, 2>,
}

impl<B: Backend> Jet<B> {
    /// 入力バッチに方向 `direction` の種を付けたジェットを作ります。
    ///
    /// 全ての行に同じ方向ベクトルが入ります。
    pub fn seed(input: Tensor<B, 2>, direction: &[f32]) -> Self {
        let [rows, dims] = input.dims();
        assert_eq!(
            dims,
            direction.len(),
            "direction has {} components but the input has {} columns",
            direction.len(),
            dims
        );
        let device = input.device();
        let tangent = direction
            .iter()
            .copied()
            .cycle()
            .take(rows * dims)
            .collect::<Vec<f32>>();
        Self {
            tangent: Tensor::from_data(TensorData::new(tangent, [rows, dims]), &device),
            curvature: Tensor::zeros([rows, dims], &device),
            value: input,
        }
    }

    /// 微分がゼロの定数ジェット。
    pub fn constant(value: Tensor<B, 2>) -> Self {
        Self {
            tangent: value.zeros_like(),
            curvature: value.zeros_like(),
            value,
        }
    }

    /// 指定した列だけを取り出したジェット（`[バッチ数, 1]`）。
    pub fn column(&self, index: usize) -> Self {
        let rows = self.value.dims()[0];
        let pick = |t: &Tensor<B, 2>| t.clone().slice([0..rows, index..index + 1]);
        Self {
            value: pick(&self.value),
            tangent: pick(&self.tangent),
            curvature: pick(&self.curvature),
        }
    }

    /// 全結合層 `x W + b` を適用します。アフィン変換なので微分には重みだけが掛かります。
    pub fn linear(self, layer: &Linear<B>) -> Self {
        let weight = layer.weight.val();
        Self {
            value: layer.forward(self.value),
            tangent: self.tangent.matmul(weight.clone()),
            curvature: self.curvature.matmul(weight),
        }
    }

    pub fn add(self, other: Self) -> Self {
        Self {
            value: self.value + other.value,
            tangent: self.tangent + other.tangent,
            curvature: self.curvature + other.curvature,
        }
    }

    pub fn sub(self, other: Self) -> Self {
        Self {
            value: self.value - other.value,
            tangent: self.tangent - other.tangent,
            curvature: self.curvature - other.curvature,
        }
    }

    /// 要素ごとの積（ライプニッツ則）。
    pub fn mul(self, other: Self) -> Self {
        let tangent = self.tangent.clone() * other.value.clone()
            + self.value.clone() * other.tangent.clone();
        let curvature = self.curvature * other.value.clone()
            + (self.tangent * other.tangent).mul_scalar(2.0)
            + self.value.clone() * other.curvature;
        Self {
            value: self.value * other.value,
            tangent,
            curvature,
        }
    }

    pub fn add_scalar(self, scalar: f64) -> Self {
        Self {
            value: self.value.add_scalar(scalar),
            ..self
        }
    }

    pub fn mul_scalar(self, scalar: f64) -> Self {
        Self {
            value: self.value.mul_scalar(scalar),
            tangent: self.tangent.mul_scalar(scalar),
            curvature: self.curvature.mul_scalar(scalar),
        }
    }

    /// 要素ごとの関数 `g` を合成します。
    ///
    /// `value` は `g(x)`、`first` と `second` は `g'(x)` と `g''(x)` です。
    fn compose(
        self,
        value: Tensor<B, 2>,
        first: Tensor<B, 2>,
        second: Tensor<B, 2>,
    ) -> Self {
        let tangent_sq = self.tangent.clone() * self.tangent.clone();
        Self {
            value,
            tangent: first.clone() * self.tangent,
            curvature: second * tangent_sq + first * self.curvature,
        }
    }

    pub fn tanh(self) -> Self {
        let t = self.value.clone().tanh();
        // tanh' = 1 - t², tanh'' = -2t(1 - t²)
        let first = (t.clone() * t.clone()).neg().add_scalar(1.0);
        let second = (t.clone() * first.clone()).mul_scalar(-2.0);
        self.compose(t, first, second)
    }

    pub fn sin(self) -> Self {
        let s = self.value.clone().sin();
        let c = self.value.clone().cos();
        let second = s.clone().neg();
        self.compose(s, c, second)
    }

    pub fn sigmoid(self) -> Self {
        let s = sigmoid(self.value.clone());
        // σ' = σ(1 - σ), σ'' = σ'(1 - 2σ)
        let first = s.clone() * s.clone().neg().add_scalar(1.0);
        let second = first.clone() * s.clone().mul_scalar(-2.0).add_scalar(1.0);
        self.compose(s, first, second)
    }

    pub fn silu(self) -> Self {
        let x = self.value.clone();
        let s = sigmoid(x.clone());
        let ds = s.clone() * s.clone().neg().add_scalar(1.0);
        // silu = xσ, silu' = σ + xσ', silu'' = σ'(2 + x(1 - 2σ))
        let value = x.clone() * s.clone();
        let first = s.clone() + x.clone() * ds.clone();
        let second = ds * (x * s.mul_scalar(-2.0).add_scalar(1.0)).add_scalar(2.0);
        self.compose(value, first, second)
    }

    pub fn exp(self) -> Self {
        let e = self.value.clone().exp();
        self.compose(e.clone(), e.clone(), e)
    }
}

/// ジェットを順伝播できる関数。ニューラルネットワークや解析解がこれを実装します。
pub trait JetModule<B: Backend> {
    fn forward_jet(&self, input: Jet<B>) -> Jet<B>;
}

/// 第 `axis` 軸の単位ベクトル。
pub fn unit_direction(dims: usize, axis: usize) -> Vec<f32> {
    let mut direction = vec![0.0; dims];
    direction[axis] = 1.0;
    direction
}

/// 方向 `direction` に沿った値・1階・2階の方向微分をまとめて求めます。
pub fn directional<B: Backend, M: JetModule<B>>(
    f: &M,
    x: Tensor<B, 2>,
    direction: &[f32],
) -> Jet<B> {
    f.forward_jet(Jet::seed(x, direction))
}

/// 1階偏微分 `∂f/∂x_i`（`[バッチ数, 出力数]`）。
pub fn partial<B: Backend, M: JetModule<B>>(f: &M, x: Tensor<B, 2>, axis: usize) -> Tensor<B, 2> {
    let dims = x.dims()[1];
    directional(f, x, &unit_direction(dims, axis)).tangent
}

/// 2階偏微分 `∂²f/∂x_i∂x_j`。
///
/// `i != j` の場合は分極恒等式
/// `∂ij f = (D²_{ei+ej} f - D²_{ei} f - D²_{ej} f) / 2` で厳密に求めます。
pub fn second_partial<B: Backend, M: JetModule<B>>(
    f: &M,
    x: Tensor<B, 2>,
    i: usize,
    j: usize,
) -> Tensor<B, 2> {
    let dims = x.dims()[1];
    let along_i = directional(f, x.clone(), &unit_direction(dims, i)).curvature;
    if i == j {
        return along_i;
    }
    let along_j = directional(f, x.clone(), &unit_direction(dims, j)).curvature;
    let mut both = unit_direction(dims, i);
    both[j] = 1.0;
    let along_both = directional(f, x, &both).curvature;
    (along_both - along_i - along_j).mul_scalar(0.5)
}

/// バッチごとのヤコビアン `[バッチ数, 出力数, 入力数]`。
pub fn jacobian<B: Backend, M: JetModule<B>>(f: &M, x: Tensor<B, 2>) -> Tensor<B, 3> {
    let dims = x.dims()[1];
    let columns = (0..dims)
        .map(|axis| partial(f, x.clone(), axis))
        .collect::<Vec<_>>();
    Tensor::stack(columns, 2)
}

/// バッチごとのヘッシアン `[バッチ数, 出力数, 入力数, 入力数]`。
pub fn hessian<B: Backend, M: JetModule<B>>(f: &M, x: Tensor<B, 2>) -> Tensor<B, 4> {
    let dims = x.dims()[1];
    let rows = (0..dims)
        .map(|i| {
            let entries = (0..dims)
                .map(|j| second_partial(f, x.clone(), i, j))
                .collect::<Vec<_>>();
            Tensor::stack::<3>(entries, 2)
        })
        .collect::<Vec<_>>();
    Tensor::stack(rows, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    /// f(x, y) = x² y + sin(y)
    struct Polynomial;

    impl<B: Backend> JetModule<B> for Polynomial {
        fn forward_jet(&self, input: Jet<B>) -> Jet<B> {
            let x = input.column(0);
            let y = input.column(1);
            x.clone().mul(x).mul(y.clone()).add(y.sin())
        }
    }

    fn values(tensor: Tensor<TestBackend, 2>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    fn points() -> Tensor<TestBackend, 2> {
        let device = Default::default();
        Tensor::from_data(
            TensorData::new(vec![1.0f32, 2.0, -0.5, 0.3, 2.0, -1.0], [3, 2]),
            &device,
        )
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{a} != {e}");
        }
    }

    #[test]
    fn first_partials_match_closed_form() {
        let x = points();
        let rows = [(1.0f32, 2.0f32), (-0.5, 0.3), (2.0, -1.0)];

        let dx = values(partial(&Polynomial, x.clone(), 0));
        let dy = values(partial(&Polynomial, x, 1));
        let expected_dx: Vec<f32> = rows.iter().map(|&(x, y)| 2.0 * x * y).collect();
        let expected_dy: Vec<f32> = rows.iter().map(|&(x, y)| x * x + y.cos()).collect();
        assert_close(&dx, &expected_dx);
        assert_close(&dy, &expected_dy);
    }

    #[test]
    fn second_partials_include_mixed_terms() {
        let x = points();
        let rows = [(1.0f32, 2.0f32), (-0.5, 0.3), (2.0, -1.0)];

        let dxx = values(second_partial(&Polynomial, x.clone(), 0, 0));
        let dyy = values(second_partial(&Polynomial, x.clone(), 1, 1));
        let dxy = values(second_partial(&Polynomial, x, 0, 1));
        let expected_dxx: Vec<f32> = rows.iter().map(|&(_, y)| 2.0 * y).collect();
        let expected_dyy: Vec<f32> = rows.iter().map(|&(_, y)| -y.sin()).collect();
        let expected_dxy: Vec<f32> = rows.iter().map(|&(x, _)| 2.0 * x).collect();
        assert_close(&dxx, &expected_dxx);
        assert_close(&dyy, &expected_dyy);
        assert_close(&dxy, &expected_dxy);
    }

    #[test]
    fn jacobian_and_hessian_shapes() {
        let x = points();
        assert_eq!(jacobian(&Polynomial, x.clone()).dims(), [3, 1, 2]);

        let hessian = hessian(&Polynomial, x);
        assert_eq!(hessian.dims(), [3, 1, 2, 2]);
        let flat: Vec<f32> = hessian.into_data().iter::<f32>().collect();
        // 第1行 (x, y) = (1, 2): [[2y, 2x], [2x, -sin y]]
        assert_close(&flat[0..4], &[4.0, 2.0, 2.0, -(2.0f32).sin()]);
    }

    #[test]
    fn constants_carry_no_derivatives() {
        let x = points();
        let seeded = Jet::seed(x.clone(), &[1.0, 0.0]);
        let shifted = seeded.clone().sub(Jet::constant(x.ones_like()));

        assert_eq!(values(shifted.tangent), values(seeded.tangent));
        assert!(values(shifted.curvature).iter().all(|v| *v == 0.0));
        assert_close(
            &values(shifted.value),
            &[0.0, 1.0, -1.5, -0.7, 1.0, -2.0],
        );
    }

    #[test]
    fn activation_rules_match_closed_form() {
        let device = Default::default();
        let z = [-1.3f32, 0.0, 0.7];
        let input =
            Tensor::<TestBackend, 2>::from_data(TensorData::new(z.to_vec(), [3, 1]), &device);
        let seeded = || Jet::seed(input.clone(), &[1.0]);

        let tanh = seeded().tanh();
        let expected: Vec<f32> = z
            .iter()
            .map(|&z| -2.0 * z.tanh() * (1.0 - z.tanh().powi(2)))
            .collect();
        assert_close(&values(tanh.curvature), &expected);

        let sigmoid = seeded().sigmoid();
        let s = |z: f32| 1.0 / (1.0 + (-z).exp());
        let expected: Vec<f32> = z.iter().map(|&z| s(z) * (1.0 - s(z))).collect();
        assert_close(&values(sigmoid.tangent), &expected);

        let silu = seeded().silu();
        let expected: Vec<f32> = z
            .iter()
            .map(|&z| s(z) * (1.0 - s(z)) * (2.0 + z * (1.0 - 2.0 * s(z))))
            .collect();
        assert_close(&values(silu.curvature), &expected);
    }
}
