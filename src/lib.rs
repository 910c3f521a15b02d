//! # 減衰・外力付き波動方程式の物理情報ニューラルネットワーク (PINN)
//!
//! `burn` フレームワークを使用して、両端を固定した弦の減衰・外力付き波動方程式を
//! PINN で解くための主要なコンポーネントを提供します。
//!
//! - [`dataset`]: コロケーション点のサンプラー
//! - [`gradient`]: 入力に関する1階・2階の厳密な微分
//! - [`pinn`]: 方程式と初期条件の残差
//! - [`training`]: 学習ループ
//! - [`bayes`] / [`search`]: ハイパーパラメータのベイズ最適化
//! - [`inference`]: 保存済みモデルでの推論

pub mod artifacts;
pub mod bayes;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod gradient;
pub mod inference;
pub mod model;
pub mod pinn;
pub mod search;
pub mod training;

pub use error::{Error, Result};
