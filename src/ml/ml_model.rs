//! 猫判定モデルの定義
//!
//! ResNet-18 の特徴抽出部（バックボーン）と、差し替え可能な2クラスの全結合ヘッドを
//! 合成したモデルです。バックボーンの固定はフラグで切り替え、構造は変わりません。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::ClassifierError;
use crate::ml::NUM_CLASSES;

/// モデル設定
#[derive(Config, Debug)]
pub struct CatClassifierConfig {
    /// 分類クラス数
    #[config(default = 2)]
    pub num_classes: usize,
    /// 基本チャネル幅（標準の ResNet-18 は64）
    #[config(default = 64)]
    pub base_width: usize,
    /// バックボーンを固定してヘッドのみ学習する
    #[config(default = false)]
    pub freeze_backbone: bool,
}

impl CatClassifierConfig {
    /// ランダム初期化したモデルを作る
    pub fn init<B: Backend>(&self, device: &B::Device) -> CatClassifier<B> {
        let backbone = ResNet18Backbone::new(self.base_width, device);
        self.assemble(backbone, device)
    }

    /// 事前学習済みのバックボーン重みを読み込んでモデルを作る
    ///
    /// 重みはバックボーン単体の Burn レコード（`DefaultFileRecorder`, f32）です。
    /// 形状が合わない場合は `Record` エラーになります。
    pub fn init_with_backbone<B: Backend>(
        &self,
        weights: &Path,
        device: &B::Device,
    ) -> crate::error::Result<CatClassifier<B>> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let backbone = ResNet18Backbone::new(self.base_width, device)
            .load_file(weights, &recorder, device)
            .map_err(|e| {
                ClassifierError::Record(format!(
                    "failed to load backbone weights {}: {:?}",
                    weights.display(),
                    e
                ))
            })?;
        tracing::info!("事前学習済みバックボーンを読み込みました: {}", weights.display());
        Ok(self.assemble(backbone, device))
    }

    fn assemble<B: Backend>(&self, backbone: ResNet18Backbone<B>, device: &B::Device) -> CatClassifier<B> {
        let backbone = if self.freeze_backbone {
            backbone.no_grad()
        } else {
            backbone
        };
        let head = LinearConfig::new(backbone.feature_dim(), self.num_classes).init(device);

        CatClassifier { backbone, head }
    }
}

/// 3x3 畳み込み（パディング1, バイアスなし）
fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

/// ショートカット側のチャネル数・解像度合わせ
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// 残差ブロック（3x3 Conv x 2）
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
    activation: Relu,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = if stride != 1 || in_channels != out_channels {
            Some(Downsample::new(in_channels, out_channels, stride, device))
        } else {
            None
        };

        Self {
            conv1: conv3x3(in_channels, out_channels, stride, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, 1, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.conv1.forward(x);
        let out = self.bn1.forward(out);
        let out = self.activation.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        self.activation.forward(out + identity)
    }
}

/// ResNet-18 の特徴抽出部
///
/// # アーキテクチャ
/// - Stem: Conv 7x7 (stride 2) + BN + ReLU + MaxPool 3x3 (stride 2)
/// - Stage1..4: BasicBlock x 2（チャネル w, 2w, 4w, 8w。Stage2以降は stride 2）
/// - Global Average Pooling
///
/// 出力は `[batch_size, 8w]` の特徴ベクトルです。
#[derive(Module, Debug)]
pub struct ResNet18Backbone<B: Backend> {
    pub(crate) stem_conv: Conv2d<B>,
    stem_bn: BatchNorm<B>,
    stem_pool: MaxPool2d,
    stages: Vec<BasicBlock<B>>,
    global_pool: AdaptiveAvgPool2d,
    activation: Relu,
    feature_dim: usize,
}

impl<B: Backend> ResNet18Backbone<B> {
    pub fn new(base_width: usize, device: &B::Device) -> Self {
        let stem_conv = Conv2dConfig::new([3, base_width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut stages = Vec::with_capacity(8);
        let mut in_channels = base_width;
        for (stage, multiplier) in [1usize, 2, 4, 8].into_iter().enumerate() {
            let out_channels = base_width * multiplier;
            let stride = if stage == 0 { 1 } else { 2 };
            stages.push(BasicBlock::new(in_channels, out_channels, stride, device));
            stages.push(BasicBlock::new(out_channels, out_channels, 1, device));
            in_channels = out_channels;
        }

        Self {
            stem_conv,
            stem_bn: BatchNormConfig::new(base_width).init(device),
            stem_pool,
            stages,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            activation: Relu::new(),
            feature_dim: in_channels,
        }
    }

    /// 特徴ベクトルの次元
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.stem_conv.forward(images);
        let x = self.stem_bn.forward(x);
        let x = self.activation.forward(x);
        let mut x = self.stem_pool.forward(x);

        for block in &self.stages {
            x = block.forward(x);
        }

        let x = self.global_pool.forward(x);
        x.reshape([batch_size, self.feature_dim])
    }
}

/// 猫判定モデル（バックボーン + 2クラスヘッド）
#[derive(Module, Debug)]
pub struct CatClassifier<B: Backend> {
    pub(crate) backbone: ResNet18Backbone<B>,
    pub(crate) head: Linear<B>,
}

impl<B: Backend> CatClassifier<B> {
    /// 順伝播
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// クラスごとの確率（softmax）
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `targets`: ターゲットラベル [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// バックボーン部分
    pub fn backbone(&self) -> &ResNet18Backbone<B> {
        &self.backbone
    }
}

/// 出力クラス数が2であることを確認する
pub fn ensure_binary(num_classes: usize) -> crate::error::Result<()> {
    if num_classes != NUM_CLASSES {
        return Err(ClassifierError::Configuration(format!(
            "classifier head must have {} outputs, got {}",
            NUM_CLASSES, num_classes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> CatClassifierConfig {
        CatClassifierConfig::new().with_base_width(4)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 32, 32], &device);

        assert_eq!(model.forward(images).dims(), [3, 2]);
        assert_eq!(model.backbone().feature_dim(), 32);
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let probs = model
            .predict_proba(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        for row in probs.chunks(2) {
            assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_standard_width_parameter_count() {
        let device = Default::default();
        let model = CatClassifierConfig::new().init::<TestBackend>(&device);
        // ResNet-18 の学習パラメータ (11,176,512) + BatchNorm の移動平均・分散 (2 * 4,800)
        // + 2クラスヘッド (512*2 + 2)
        assert_eq!(model.num_params(), 11_176_512 + 9_600 + 1_026);
        assert_eq!(model.num_params(), 11_187_138);
    }

    #[test]
    fn test_load_pretrained_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone");
        let device = Default::default();
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();

        let source = ResNet18Backbone::<TestBackend>::new(4, &device);
        let expected = source.stem_conv.weight.val().into_data().to_vec::<f32>().unwrap();
        source.save_file(&path, &recorder).unwrap();

        let model = small_config()
            .init_with_backbone::<TestBackend>(&path.with_extension("mpk"), &device)
            .unwrap();
        let loaded = model.backbone.stem_conv.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_missing_backbone_file_is_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let err = small_config()
            .init_with_backbone::<TestBackend>(&dir.path().join("none.mpk"), &device)
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Record(_)));
    }

    #[test]
    fn test_ensure_binary() {
        assert!(ensure_binary(2).is_ok());
        assert!(ensure_binary(3).is_err());
    }
}
