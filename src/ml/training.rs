//! モデル学習
//!
//! 各エポックは2段階です。
//! 1. 学習フェーズ: データ拡張したバッチで順伝播・逆伝播し、オプティマイザで重みを更新
//! 2. 評価フェーズ: `model.valid()` で勾配を切り離したモデルを検証データ全体に適用（重みは変更しない）
//!
//! 評価後に検証メトリクスがこれまでの最良を厳密に上回った場合のみチェックポイントを上書きし、
//! 結果に関わらずエポックメトリクスを1行追記します。

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};

use crate::error::{ClassifierError, Result};
use crate::ml::batcher::{BatchLoader, ImageBatch, ImageBatcher, LoaderMode};
use crate::ml::dataset::{DatasetSplit, LabeledImageSource};
use crate::ml::metrics::{EpochMetrics, MetricsLog};
use crate::ml::ml_model::{CatClassifier, CatClassifierConfig};
use crate::ml::transform::{AugmentationPipeline, EvalTransform};
use crate::model::{save_checkpoint, AppConfig, CheckpointMetadata, ClassIndexMapping, SelectionPolicy};

/// 1フェーズ分の集計結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    /// サンプル平均の損失
    pub loss: f64,
    /// 正解率（0〜1）
    pub accuracy: f64,
    pub samples: usize,
}

#[derive(Debug, Default)]
struct PhaseAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl PhaseAccumulator {
    fn add(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    fn finish(self) -> Option<PhaseMetrics> {
        if self.total == 0 {
            return None;
        }
        Some(PhaseMetrics {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64,
            samples: self.total,
        })
    }
}

/// 損失が有限値であることを確認する
pub(crate) fn check_finite(loss: f64, epoch: usize, batch: usize) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(ClassifierError::TrainingDiverged { epoch, batch, loss })
    }
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

/// 学習フェーズ（1エポック）
///
/// 損失が有限値でなくなった時点で `TrainingDiverged` を返し、そのバッチの逆伝播は行いません。
pub fn train_epoch<B, O>(
    mut model: CatClassifier<B>,
    optimizer: &mut O,
    loader: &BatchLoader,
    batcher: &ImageBatcher,
    learning_rate: f64,
    epoch: usize,
    device: &B::Device,
) -> Result<(CatClassifier<B>, PhaseMetrics)>
where
    B: AutodiffBackend,
    O: Optimizer<CatClassifier<B>, B>,
{
    let mut acc = PhaseAccumulator::default();
    let num_batches = loader.num_batches();

    for (batch_idx, items) in loader.epoch(epoch).enumerate() {
        let batch: ImageBatch<B> = batcher.batch(items, device);
        let batch_size = batch.targets.dims()[0];

        let item = model.forward_classification(batch.images, batch.targets);
        let loss_value: f64 = item.loss.clone().into_scalar().elem();
        check_finite(loss_value, epoch, batch_idx + 1)?;
        let correct = count_correct(item.output, item.targets);

        let grads = item.loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optimizer.step(learning_rate, model, grads);

        acc.add(loss_value, correct, batch_size);
        tracing::debug!(
            "  Batch {}/{}: loss = {:.4}, acc = {}/{}",
            batch_idx + 1,
            num_batches,
            loss_value,
            correct,
            batch_size
        );
    }

    let metrics = acc.finish().ok_or_else(|| {
        ClassifierError::Configuration("training subset produced no readable samples".to_string())
    })?;
    Ok((model, metrics))
}

/// 評価フェーズ（重みは変更しない）
pub fn evaluate<B: Backend>(
    model: &CatClassifier<B>,
    loader: &BatchLoader,
    batcher: &ImageBatcher,
    epoch: usize,
    device: &B::Device,
) -> Result<PhaseMetrics> {
    let mut acc = PhaseAccumulator::default();

    for (batch_idx, items) in loader.epoch(epoch).enumerate() {
        let batch: ImageBatch<B> = batcher.batch(items, device);
        let batch_size = batch.targets.dims()[0];

        let item = model.forward_classification(batch.images, batch.targets);
        let loss_value: f64 = item.loss.into_scalar().elem();
        check_finite(loss_value, epoch, batch_idx + 1)?;

        acc.add(loss_value, count_correct(item.output, item.targets), batch_size);
    }

    acc.finish().ok_or_else(|| {
        ClassifierError::Configuration("validation subset produced no readable samples".to_string())
    })
}

/// ベストチェックポイントの判定
///
/// 最初のエポックは必ず採用し、以降は方針に従って厳密に良い場合のみ採用します。
#[derive(Debug, Clone)]
pub struct CheckpointSelector {
    policy: SelectionPolicy,
    best: Option<EpochMetrics>,
}

impl CheckpointSelector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self { policy, best: None }
    }

    fn is_better(&self, candidate: &EpochMetrics, best: &EpochMetrics) -> bool {
        match self.policy {
            SelectionPolicy::AccuracyThenLoss => {
                candidate.val_acc > best.val_acc
                    || (candidate.val_acc == best.val_acc && candidate.val_loss < best.val_loss)
            }
            SelectionPolicy::LowestLoss => candidate.val_loss < best.val_loss,
        }
    }

    /// エポックの結果を記録し、チェックポイントを上書きすべきなら true を返す
    pub fn observe(&mut self, metrics: &EpochMetrics) -> bool {
        let improved = match &self.best {
            None => true,
            Some(best) => self.is_better(metrics, best),
        };
        if improved {
            self.best = Some(metrics.clone());
        }
        improved
    }

    pub fn best(&self) -> Option<&EpochMetrics> {
        self.best.as_ref()
    }
}

/// 学習結果のまとめ
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// エポックごとのメトリクス（ログに書いたものと同じ）
    pub epochs: Vec<EpochMetrics>,
    /// チェックポイントを上書きした回数
    pub checkpoints_written: usize,
    /// 最終的なチェックポイントのエポック
    pub best_epoch: usize,
}

/// 改善したエポックだけチェックポイントを書き出す
struct BestCheckpoint<'a> {
    config: &'a AppConfig,
    class_map: &'a ClassIndexMapping,
    selector: CheckpointSelector,
    written: usize,
}

impl<'a> BestCheckpoint<'a> {
    fn new(config: &'a AppConfig, class_map: &'a ClassIndexMapping) -> Self {
        Self {
            config,
            class_map,
            selector: CheckpointSelector::new(config.training.selection_policy),
            written: 0,
        }
    }

    /// 改善していればモデルを書き出して true を返す
    fn observe<B: Backend>(&mut self, model: &CatClassifier<B>, metrics: &EpochMetrics) -> Result<bool> {
        if !self.selector.observe(metrics) {
            return Ok(false);
        }
        write_checkpoint(model, self.config, self.class_map, metrics)?;
        self.written += 1;
        Ok(true)
    }

    fn best_epoch(&self) -> usize {
        self.selector.best().map(|m| m.epoch).unwrap_or(0)
    }
}

fn write_checkpoint<B: Backend>(
    model: &CatClassifier<B>,
    config: &AppConfig,
    class_map: &ClassIndexMapping,
    metrics: &EpochMetrics,
) -> Result<()> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let weights = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| ClassifierError::Record(format!("failed to serialize weights: {:?}", e)))?;

    let metadata = CheckpointMetadata::new(
        config.model.base_width,
        config.model.image_size,
        model.num_params(),
        class_map.clone(),
        config.model.freeze_backbone,
        metrics.epoch,
        metrics.train_loss,
        metrics.train_acc,
        metrics.val_loss,
        metrics.val_acc,
    );

    save_checkpoint(
        &config.model.checkpoint_path,
        &config.model.class_map_path,
        &metadata,
        &weights,
    )
}

/// モデル学習を実行
///
/// データセットを走査・分割し、設定されたエポック数だけ学習します。
/// チェックポイントは `config.model.checkpoint_path`、クラスマッピングは
/// `config.model.class_map_path`、メトリクスは `config.training.log_path` に書き出します。
/// チェックポイントとクラスマッピングは改善したエポックでのみ書き換わり、
/// 途中で失敗した実行は以前のチェックポイントをそのまま残します。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let training = &config.training;

    tracing::info!("データセットを走査します: {}", training.data_dir.display());
    let source = LabeledImageSource::scan(&training.data_dir)?;
    let split = source.split(training.train_ratio, training.seed)?;
    let class_map = source.class_map().clone();

    tracing::info!("学習データ: {} 枚", split.train.samples().len());
    tracing::info!("検証データ: {} 枚", split.val.samples().len());

    let model_config = CatClassifierConfig::new()
        .with_base_width(config.model.base_width)
        .with_freeze_backbone(config.model.freeze_backbone);
    let model = match &config.model.pretrained_backbone {
        Some(path) => model_config.init_with_backbone::<B>(path, device)?,
        None => model_config.init::<B>(device),
    };

    fit(config, model, &class_map, split, device)
}

/// 初期化済みのモデルをエポック数だけ学習する
fn fit<B: AutodiffBackend>(
    config: &AppConfig,
    mut model: CatClassifier<B>,
    class_map: &ClassIndexMapping,
    split: DatasetSplit,
    device: &B::Device,
) -> Result<TrainingReport> {
    let training = &config.training;
    let image_size = config.model.image_size;
    let mut optimizer = AdamConfig::new().init();

    tracing::info!(
        "モデル: ResNet-18 (幅 {}), パラメータ数 {}, バックボーン固定: {}",
        config.model.base_width,
        model.num_params(),
        config.model.freeze_backbone
    );
    tracing::info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        training.num_epochs,
        training.batch_size,
        training.learning_rate
    );

    let train_loader = BatchLoader::new(
        split.train,
        training.batch_size,
        LoaderMode::Train(AugmentationPipeline::new(config.augmentation.clone(), image_size)),
        training.seed,
        training.num_workers,
    )?;
    let val_loader = BatchLoader::new(
        split.val,
        training.batch_size,
        LoaderMode::Eval(EvalTransform::new(image_size)),
        training.seed,
        training.num_workers,
    )?;
    let batcher = ImageBatcher::new(image_size as usize);

    let mut metrics_log = MetricsLog::create(&training.log_path)?;
    let mut best = BestCheckpoint::new(config, class_map);
    let mut epochs = Vec::with_capacity(training.num_epochs);

    for epoch in 1..=training.num_epochs {
        tracing::info!("Epoch {}/{}", epoch, training.num_epochs);

        let (trained, train) = train_epoch(
            model,
            &mut optimizer,
            &train_loader,
            &batcher,
            training.learning_rate,
            epoch,
            device,
        )?;
        model = trained;

        let valid_model = model.valid();
        let val = evaluate(&valid_model, &val_loader, &batcher, epoch, device)?;

        let metrics = EpochMetrics::new(epoch, train.loss, train.accuracy, val.loss, val.accuracy);
        let improved = best.observe(&valid_model, &metrics)?;

        tracing::info!(
            "  → Loss: {:.4} | Train Acc: {:.2}% | Val Loss: {:.4} | Val Acc: {:.2}%{}",
            metrics.train_loss,
            metrics.train_acc * 100.0,
            metrics.val_loss,
            metrics.val_acc * 100.0,
            if improved { " (チェックポイント更新)" } else { "" }
        );

        metrics_log.append(&metrics)?;
        epochs.push(metrics);
    }

    let best_epoch = best.best_epoch();
    tracing::info!(
        "学習完了: ベストはエポック {}（チェックポイント更新 {} 回）",
        best_epoch,
        best.written
    );

    Ok(TrainingReport {
        epochs,
        checkpoints_written: best.written,
        best_epoch,
    })
}
