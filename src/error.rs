//! エラー型の定義
//!
//! 学習・推論コアで発生するエラーを分類します。
//! データセット上の個別サンプルの問題はここには含めず、`tracing::warn!` で記録してスキップします。

use thiserror::Error;

/// 分類器コアのエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// 実行前の設定エラー（クラスディレクトリ欠落・空、分割比率不正、エポック数やバッチサイズが0など）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 損失が有限値でなくなった（学習全体を中断し、チェックポイントは書き込まない）
    #[error("Training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    TrainingDiverged { epoch: usize, batch: usize, loss: f64 },

    /// 推論入力が画像としてデコードできない
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// チェックポイントが存在しない、またはクラスマッピングと対応しない
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Burn の Recorder によるモデル重みの読み書きエラー
    #[error("Record error: {0}")]
    Record(String),
}

impl From<serde_json::Error> for ClassifierError {
    fn from(e: serde_json::Error) -> Self {
        ClassifierError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
