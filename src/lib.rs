//! 猫 / 猫以外の画像分類器
//!
//! - `model`: 設定、クラスマッピング、チェックポイントの保存・読み込み
//! - `ml`: データセット、データ拡張、ResNet-18 モデル、学習ループ、推論（`ml` フィーチャー）

pub mod error;
pub mod logging;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use error::{ClassifierError, Result};
