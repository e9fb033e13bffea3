//! バッチローダー
//!
//! 分割済みのサンプル集合からバッチを作ります。
//! - 学習用: エポックごとにシードから決まる順序でシャッフルし、各サンプルにデータ拡張を適用
//! - 検証用: 順序を保ったまま決定的な変換のみ適用
//!
//! サンプルごとの拡張用シードは (シード, エポック, サンプル番号) から導出するため、
//! 並列デコードのワーカー数に関係なく同じ結果になります。

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::error::{ClassifierError, Result};
use crate::ml::dataset::{ImageSubset, Sample};
use crate::ml::transform::{decode_image_path, AugmentationPipeline, EvalTransform};

/// 変換の種類
#[derive(Debug, Clone)]
pub enum LoaderMode {
    /// ランダムなデータ拡張（学習用）
    Train(AugmentationPipeline),
    /// 決定的な変換（検証用）
    Eval(EvalTransform),
}

impl LoaderMode {
    pub fn image_size(&self) -> u32 {
        match self {
            LoaderMode::Train(p) => p.image_size(),
            LoaderMode::Eval(t) => t.image_size(),
        }
    }
}

/// 正規化済みの1サンプル（CHW順）
#[derive(Clone, Debug)]
pub struct PreparedImage {
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// splitmix64 で複数の値から1つのシードを導出する
pub(crate) fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    let mut state = seed;
    for &part in parts {
        state ^= part.wrapping_add(0x9E37_79B9_7F4A_7C15);
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state = z ^ (z >> 31);
    }
    state
}

pub struct BatchLoader {
    dataset: ImageSubset,
    batch_size: usize,
    mode: LoaderMode,
    seed: u64,
    pool: Option<rayon::ThreadPool>,
}

impl BatchLoader {
    /// `num_workers` が2以上ならバッチ内の画像デコードを専用スレッドプールで並列化する
    pub fn new(
        dataset: ImageSubset,
        batch_size: usize,
        mode: LoaderMode,
        seed: u64,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ClassifierError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        let pool = if num_workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .build()
                    .map_err(|e| ClassifierError::Configuration(format!("failed to build worker pool: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            dataset,
            batch_size,
            mode,
            seed,
            pool,
        })
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// 1エポックあたりのバッチ数（端数のバッチも含む）
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// エポック内のサンプル順序
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let LoaderMode::Train(_) = self.mode {
            let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, &[epoch as u64]));
            order.shuffle(&mut rng);
        }
        order
    }

    /// 1エポック分のバッチを順に返すイテレータ
    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            loader: self,
            epoch,
            order: self.epoch_order(epoch),
            cursor: 0,
        }
    }

    fn prepare(&self, epoch: usize, index: usize, sample: &Sample) -> Option<PreparedImage> {
        let image = match decode_image_path(&sample.path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("バッチ作成時に画像を読み込めないためスキップします: {}", e);
                return None;
            }
        };

        let pixels = match &self.mode {
            LoaderMode::Train(pipeline) => {
                let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, &[epoch as u64, index as u64]));
                pipeline.apply_normalized(&image, &mut rng)
            }
            LoaderMode::Eval(transform) => transform.apply_normalized(&image),
        };

        Some(PreparedImage {
            pixels,
            label: sample.label,
        })
    }

    fn prepare_chunk(&self, epoch: usize, indices: &[usize]) -> Vec<PreparedImage> {
        let samples = self.dataset.samples();
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .filter_map(|&i| self.prepare(epoch, i, &samples[i]))
                    .collect()
            }),
            None => indices
                .iter()
                .filter_map(|&i| self.prepare(epoch, i, &samples[i]))
                .collect(),
        }
    }
}

/// 1エポック分のバッチ
pub struct EpochBatches<'a> {
    loader: &'a BatchLoader,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Vec<PreparedImage>;

    fn next(&mut self) -> Option<Self::Item> {
        // 全サンプルの読み込みに失敗したバッチは飛ばす
        while self.cursor < self.order.len() {
            let end = (self.cursor + self.loader.batch_size).min(self.order.len());
            let chunk = &self.order[self.cursor..end];
            self.cursor = end;

            let items = self.loader.prepare_chunk(self.epoch, chunk);
            if !items.is_empty() {
                return Some(items);
            }
        }
        None
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, PreparedImage, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<PreparedImage>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        ImageBatch { images, targets }
    }
}
