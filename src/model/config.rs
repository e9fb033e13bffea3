//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル、学習、データ拡張の設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// ベストチェックポイントの選択方針
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// 検証精度が高い方。同点なら検証損失が低い方
    #[default]
    AccuracyThenLoss,
    /// 検証損失が低い方
    LowestLoss,
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// チェックポイント（tar.gz）のパス
    pub checkpoint_path: PathBuf,
    /// クラスインデックスマッピング（JSON）のパス
    pub class_map_path: PathBuf,
    /// 入力画像サイズ（正方形）
    pub image_size: u32,
    /// ResNet-18 の基本チャネル幅（標準は64）
    #[serde(default = "default_base_width")]
    pub base_width: usize,
    /// 事前学習済みバックボーンの重み（Burnレコード）。None ならランダム初期化
    #[serde(default)]
    pub pretrained_backbone: Option<PathBuf>,
    /// バックボーンを固定してヘッドのみを学習するか
    #[serde(default)]
    pub freeze_backbone: bool,
}

fn default_base_width() -> usize {
    64
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/cats_resnet18.tar.gz"),
            class_map_path: PathBuf::from("models/class_to_idx.json"),
            image_size: 224,
            base_width: default_base_width(),
            pretrained_backbone: None,
            freeze_backbone: false,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// データセットのルート（クラスごとのサブディレクトリを含む）
    pub data_dir: PathBuf,
    /// エポックメトリクスのJSONLログ
    pub log_path: PathBuf,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 画像デコードのワーカー数（0または1で逐次処理）
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
    /// チェックポイント選択方針
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dataset"),
            log_path: PathBuf::from("logs/train_log.jsonl"),
            num_epochs: 10,
            batch_size: 8,
            num_workers: 2,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
            selection_policy: SelectionPolicy::default(),
        }
    }
}

impl TrainingSettings {
    /// 学習開始前に設定値を検証する
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(ClassifierError::Configuration(
                "num_epochs must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ClassifierError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(ClassifierError::Configuration(format!(
                "train_ratio must be in (0, 1), got {}",
                self.train_ratio
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ClassifierError::Configuration(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// データ拡張設定
///
/// 各値は `ml::transform::AugmentationPipeline` の乱数範囲になります。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 左右反転の確率
    pub flip_probability: f64,
    /// 回転角の最大値（度、±）
    pub max_rotation_degrees: f32,
    /// ランダムクロップの面積比の範囲
    pub crop_scale: (f32, f32),
    /// ランダムクロップのアスペクト比の範囲
    pub crop_ratio: (f32, f32),
    /// 明るさの揺らぎ幅（係数は 1±brightness）
    pub brightness: f32,
    /// コントラストの揺らぎ幅
    pub contrast: f32,
    /// 彩度の揺らぎ幅
    pub saturation: f32,
    /// 色相の揺らぎ幅（1周を1.0とした割合、0.5以下）
    pub hue: f32,
    /// 射影変換を適用する確率
    #[serde(default = "default_perspective_probability")]
    pub perspective_probability: f64,
    /// 射影変換の歪みの大きさ（0〜1）
    #[serde(default = "default_distortion_scale")]
    pub distortion_scale: f32,
    /// ガウシアンぼかしを適用する確率
    pub blur_probability: f64,
    /// ガウシアンぼかしのシグマ範囲
    pub blur_sigma: (f32, f32),
}

fn default_perspective_probability() -> f64 {
    0.2
}

fn default_distortion_scale() -> f32 {
    0.3
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            max_rotation_degrees: 12.0,
            crop_scale: (0.7, 1.0),
            crop_ratio: (3.0 / 4.0, 4.0 / 3.0),
            brightness: 0.25,
            contrast: 0.25,
            saturation: 0.15,
            hue: 0.02,
            perspective_probability: default_perspective_probability(),
            distortion_scale: default_distortion_scale(),
            blur_probability: 1.0,
            blur_sigma: (0.1, 1.5),
        }
    }
}

impl AugmentationSettings {
    pub fn validate(&self) -> Result<()> {
        let probability_ok = |p: f64| (0.0..=1.0).contains(&p);
        if !probability_ok(self.flip_probability)
            || !probability_ok(self.perspective_probability)
            || !probability_ok(self.blur_probability)
        {
            return Err(ClassifierError::Configuration(
                "augmentation probabilities must be in [0, 1]".to_string(),
            ));
        }
        let finite = [
            self.max_rotation_degrees,
            self.crop_scale.0,
            self.crop_scale.1,
            self.crop_ratio.0,
            self.crop_ratio.1,
            self.brightness,
            self.contrast,
            self.saturation,
            self.hue,
            self.distortion_scale,
            self.blur_sigma.0,
            self.blur_sigma.1,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(ClassifierError::Configuration(
                "augmentation ranges must be finite".to_string(),
            ));
        }
        if self.max_rotation_degrees < 0.0 {
            return Err(ClassifierError::Configuration(format!(
                "max_rotation_degrees must be non-negative, got {}",
                self.max_rotation_degrees
            )));
        }
        let (lo, hi) = self.crop_scale;
        if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
            return Err(ClassifierError::Configuration(format!(
                "crop_scale must satisfy 0 < min <= max <= 1, got ({}, {})",
                lo, hi
            )));
        }
        let (lo, hi) = self.crop_ratio;
        if !(lo > 0.0 && lo <= hi) {
            return Err(ClassifierError::Configuration(format!(
                "crop_ratio must satisfy 0 < min <= max, got ({}, {})",
                lo, hi
            )));
        }
        if !(0.0..=0.5).contains(&self.hue) {
            return Err(ClassifierError::Configuration(format!(
                "hue jitter must be in [0, 0.5], got {}",
                self.hue
            )));
        }
        if self.brightness < 0.0 || self.contrast < 0.0 || self.saturation < 0.0 {
            return Err(ClassifierError::Configuration(
                "color jitter ranges must be non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.distortion_scale) {
            return Err(ClassifierError::Configuration(format!(
                "distortion_scale must be in [0, 1], got {}",
                self.distortion_scale
            )));
        }
        let (lo, hi) = self.blur_sigma;
        if !(lo > 0.0 && lo <= hi) {
            return Err(ClassifierError::Configuration(format!(
                "blur_sigma must satisfy 0 < min <= max, got ({}, {})",
                lo, hi
            )));
        }
        Ok(())
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルがあるのに読めない・解析できない場合は `Configuration` エラーです。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Ok(Self::default());
        }
        let config = Self::load(path).map_err(|e| {
            ClassifierError::Configuration(format!("failed to load config {}: {}", path.display(), e))
        })?;
        tracing::info!("設定ファイルを読み込みました: {}", path.display());
        Ok(config)
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 全体の設定値を検証する
    pub fn validate(&self) -> Result<()> {
        if self.model.image_size == 0 {
            return Err(ClassifierError::Configuration(
                "image_size must be positive".to_string(),
            ));
        }
        if self.model.base_width == 0 {
            return Err(ClassifierError::Configuration(
                "base_width must be positive".to_string(),
            ));
        }
        self.training.validate()?;
        self.augmentation.validate()
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("チェックポイント: {}", self.model.checkpoint_path.display());
        println!("クラスマッピング: {}", self.model.class_map_path.display());
        println!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        println!("バックボーン固定: {}", self.model.freeze_backbone);
        println!("\n--- トレーニング設定 ---");
        println!("データセット: {}", self.training.data_dir.display());
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("分割比率: {}", self.training.train_ratio);
        println!("シード: {}", self.training.seed);
        println!("選択方針: {:?}", self.training.selection_policy);
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.num_epochs, 10);
        assert_eq!(config.training.selection_policy, SelectionPolicy::AccuracyThenLoss);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.training.batch_size, deserialized.training.batch_size);
        assert_eq!(config.augmentation.crop_scale, deserialized.augmentation.crop_scale);
    }

    #[test]
    fn test_invalid_training_values() {
        let mut training = TrainingSettings::default();
        training.num_epochs = 0;
        assert!(matches!(training.validate(), Err(ClassifierError::Configuration(_))));

        let mut training = TrainingSettings::default();
        training.batch_size = 0;
        assert!(matches!(training.validate(), Err(ClassifierError::Configuration(_))));

        for ratio in [0.0, 1.0, -0.5, 1.5, f32::NAN] {
            let mut training = TrainingSettings::default();
            training.train_ratio = ratio;
            assert!(training.validate().is_err(), "ratio {} accepted", ratio);
        }
    }

    #[test]
    fn test_invalid_augmentation_values() {
        let mut aug = AugmentationSettings::default();
        aug.crop_scale = (0.0, 1.0);
        assert!(aug.validate().is_err());

        let mut aug = AugmentationSettings::default();
        aug.flip_probability = 1.5;
        assert!(aug.validate().is_err());

        let mut aug = AugmentationSettings::default();
        aug.perspective_probability = -0.1;
        assert!(aug.validate().is_err());

        let mut aug = AugmentationSettings::default();
        aug.distortion_scale = 1.5;
        assert!(aug.validate().is_err());
    }

    #[test]
    fn test_non_finite_augmentation_ranges_are_rejected() {
        let cases: [fn(&mut AugmentationSettings); 5] = [
            |a| a.max_rotation_degrees = f32::INFINITY,
            |a| a.crop_ratio.1 = f32::INFINITY,
            |a| a.blur_sigma.1 = f32::INFINITY,
            |a| a.blur_sigma = (0.0, 1.0),
            |a| a.distortion_scale = f32::NAN,
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut aug = AugmentationSettings::default();
            mutate(&mut aug);
            assert!(
                matches!(aug.validate(), Err(ClassifierError::Configuration(_))),
                "case {} accepted",
                i
            );
        }
        assert!(AugmentationSettings::default().validate().is_ok());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path().join("nope.json")).unwrap();
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_load_or_default_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut value = serde_json::to_value(AppConfig::default()).unwrap();
        value["training"]["num_epochs"] = serde_json::json!("5");
        std::fs::write(&path, value.to_string()).unwrap();

        let err = AppConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::Configuration(_)));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            AppConfig::load_or_default(&path),
            Err(ClassifierError::Configuration(_))
        ));
    }

    #[test]
    fn test_augmentation_fields_default_when_missing() {
        let mut value = serde_json::to_value(AugmentationSettings::default()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("perspective_probability");
        object.remove("distortion_scale");

        let aug: AugmentationSettings = serde_json::from_value(value).unwrap();
        assert_eq!(aug.perspective_probability, 0.2);
        assert_eq!(aug.distortion_scale, 0.3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 3;
        config.model.freeze_backbone = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 3);
        assert!(loaded.model.freeze_backbone);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
