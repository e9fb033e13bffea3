//! チェックポイントメタデータの定義
//!
//! tar.gz形式のチェックポイントに `metadata.json` として格納される情報です。
//! アーキテクチャの互換性確認と、ベストチェックポイントの記録に使います。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::class_map::ClassIndexMapping;

/// 現在のモデル構造を表すタグ
pub const ARCHITECTURE: &str = "resnet18-2class";

/// チェックポイントメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// モデル構造のタグ（読み込み時に一致を確認する）
    pub architecture: String,

    /// ResNet-18 の基本チャネル幅
    pub base_width: usize,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// パラメータ総数（重みの形状が構造と一致するかの確認に使う）
    pub num_params: usize,

    /// 学習時のクラスインデックスマッピング
    pub class_to_idx: ClassIndexMapping,

    /// バックボーンを固定して学習したか
    pub freeze_backbone: bool,

    /// このチェックポイントを書き出したエポック（1始まり）
    pub epoch: usize,

    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl CheckpointMetadata {
    /// 新しいメタデータを作成
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_width: usize,
        image_size: u32,
        num_params: usize,
        class_to_idx: ClassIndexMapping,
        freeze_backbone: bool,
        epoch: usize,
        train_loss: f64,
        train_acc: f64,
        val_loss: f64,
        val_acc: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            architecture: ARCHITECTURE.to_string(),
            base_width,
            image_size,
            num_params,
            class_to_idx,
            freeze_backbone,
            epoch,
            train_loss,
            train_acc,
            val_loss,
            val_acc,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &CheckpointMetadata) {
    println!("\n=== チェックポイントメタデータ ===");
    println!("アーキテクチャ: {} (幅 {})", metadata.architecture, metadata.base_width);
    println!("入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    println!("パラメータ数: {}", metadata.num_params);
    println!("クラス: {}", metadata.class_to_idx.names().join(", "));
    println!("バックボーン固定: {}", metadata.freeze_backbone);
    println!("エポック: {}", metadata.epoch);
    println!(
        "学習: loss={:.4} acc={:.4} | 検証: loss={:.4} acc={:.4}",
        metadata.train_loss, metadata.train_acc, metadata.val_loss, metadata.val_acc
    );
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
