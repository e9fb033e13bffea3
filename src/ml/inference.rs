//! モデル推論機能
//!
//! チェックポイントとクラスマッピングを1度だけ読み込み、単一画像のラベルと確信度を返します。
//! 読み込み後のモデルは読み取り専用で、`&self` からのみ使用します。

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::DynamicImage;
use serde::Serialize;

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::{ensure_binary, CatClassifier, CatClassifierConfig};
use crate::ml::transform::{decode_image_bytes, decode_image_path, EvalTransform};
use crate::model::{load_checkpoint, CheckpointMetadata, ClassIndexMapping, ARCHITECTURE};

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 予測クラス名
    pub label: String,
    pub class_index: usize,
    /// 予測クラスの確率（0〜1）
    pub confidence: f32,
    /// クラスインデックス順の確率（合計1）
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
#[derive(Debug)]
pub struct InferenceEngine<B: Backend> {
    model: CatClassifier<B>,
    metadata: CheckpointMetadata,
    class_map: ClassIndexMapping,
    transform: EvalTransform,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイントとクラスマッピングを読み込んで推論エンジンを初期化
    ///
    /// ファイルがない、マッピングが対応しない、構造が一致しない場合は `ModelNotLoaded` を返します。
    pub fn load(artifact_path: &Path, class_map_path: &Path, device: &B::Device) -> Result<Self> {
        let (metadata, weights, class_map) = load_checkpoint(artifact_path, class_map_path)?;

        if metadata.architecture != ARCHITECTURE {
            return Err(ClassifierError::ModelNotLoaded(format!(
                "checkpoint architecture '{}' does not match '{}'",
                metadata.architecture, ARCHITECTURE
            )));
        }
        ensure_binary(class_map.len()).map_err(|e| ClassifierError::ModelNotLoaded(e.to_string()))?;

        let model = CatClassifierConfig::new()
            .with_num_classes(class_map.len())
            .with_base_width(metadata.base_width)
            .init::<B>(device);
        if model.num_params() != metadata.num_params {
            return Err(ClassifierError::ModelNotLoaded(format!(
                "checkpoint has {} parameters, model structure expects {}",
                metadata.num_params,
                model.num_params()
            )));
        }

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder.load(weights, device).map_err(|e| {
            ClassifierError::ModelNotLoaded(format!("failed to restore weights: {:?}", e))
        })?;
        let model = model.load_record(record);

        tracing::info!(
            "モデルを読み込みました: {} (エポック {}, 検証精度 {:.4})",
            artifact_path.display(),
            metadata.epoch,
            metadata.val_acc
        );

        Ok(Self {
            transform: EvalTransform::new(metadata.image_size),
            model,
            metadata,
            class_map,
            device: device.clone(),
        })
    }

    /// 画像ファイルを分類
    pub fn predict_path(&self, image_path: &Path) -> Result<Prediction> {
        let image = decode_image_path(image_path)?;
        self.predict_image(&image)
    }

    /// メモリ上の画像データを分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let image = decode_image_bytes(bytes)?;
        self.predict_image(&image)
    }

    /// デコード済み画像を分類
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction> {
        let size = self.transform.image_size() as usize;
        let pixels = self.transform.apply_normalized(image);

        // Tensorに変換 [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device).reshape([1, 3, size, size]);
        let probabilities = self
            .model
            .predict_proba(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Serialization(format!("failed to read probabilities: {:?}", e)))?;

        let (class_index, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let label = self
            .class_map
            .name_of(class_index)
            .ok_or_else(|| {
                ClassifierError::ModelNotLoaded(format!("class index {} is not in the class mapping", class_index))
            })?
            .to_string();

        Ok(Prediction {
            label,
            class_index,
            confidence,
            probabilities,
        })
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    pub fn class_map(&self) -> &ClassIndexMapping {
        &self.class_map
    }
}

/// プロセス全体で共有する推論エンジン
///
/// 最初の呼び出しでチェックポイントを読み込み、以降の呼び出しは同じモデルを再利用します。
/// 読み込みに失敗した場合は未初期化のまま残り、次の呼び出しで再試行されます。
pub mod shared {
    use std::sync::Mutex;

    use burn_ndarray::{NdArray, NdArrayDevice};
    use once_cell::sync::OnceCell;

    use super::*;

    struct SharedEngine {
        artifact_path: PathBuf,
        class_map_path: PathBuf,
        engine: Mutex<InferenceEngine<NdArray<f32>>>,
    }

    static ENGINE: OnceCell<SharedEngine> = OnceCell::new();

    fn engine(artifact_path: &Path, class_map_path: &Path) -> Result<&'static SharedEngine> {
        let shared = ENGINE.get_or_try_init(|| {
            let engine = InferenceEngine::load(artifact_path, class_map_path, &NdArrayDevice::Cpu)?;
            Ok::<_, ClassifierError>(SharedEngine {
                artifact_path: artifact_path.to_path_buf(),
                class_map_path: class_map_path.to_path_buf(),
                engine: Mutex::new(engine),
            })
        })?;

        if shared.artifact_path != artifact_path || shared.class_map_path != class_map_path {
            tracing::warn!(
                "推論エンジンは {} で初期化済みです。{} は読み込みません",
                shared.artifact_path.display(),
                artifact_path.display()
            );
        }
        Ok(shared)
    }

    fn with_engine<T>(
        artifact_path: &Path,
        class_map_path: &Path,
        f: impl FnOnce(&InferenceEngine<NdArray<f32>>) -> Result<T>,
    ) -> Result<T> {
        let shared = engine(artifact_path, class_map_path)?;
        // 推論はモデルを変更しないので、毒化したロックもそのまま使う
        let guard = shared.engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// 読み込み済みか
    pub fn is_loaded() -> bool {
        ENGINE.get().is_some()
    }

    /// 画像ファイルを分類
    pub fn predict_path(artifact_path: &Path, class_map_path: &Path, image_path: &Path) -> Result<Prediction> {
        with_engine(artifact_path, class_map_path, |engine| engine.predict_path(image_path))
    }

    /// メモリ上の画像データを分類
    pub fn predict_bytes(artifact_path: &Path, class_map_path: &Path, bytes: &[u8]) -> Result<Prediction> {
        with_engine(artifact_path, class_map_path, |engine| engine.predict_bytes(bytes))
    }
}
