//! ラベル付き画像ソース
//!
//! データセットのルート直下にある2つのクラスディレクトリを走査し、
//! クラス名のアルファベット順でクラスインデックスを割り当てます。
//! デコードできないファイルは警告を記録してスキップします。

use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{ClassifierError, Result};
use crate::ml::transform::decode_image_path;
use crate::ml::NUM_CLASSES;
use crate::model::ClassIndexMapping;

/// 1サンプル（画像パス, クラスインデックス）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// 走査済みのラベル付き画像一覧
#[derive(Debug, Clone)]
pub struct LabeledImageSource {
    root: PathBuf,
    samples: Vec<Sample>,
    class_map: ClassIndexMapping,
    skipped: Vec<PathBuf>,
}

impl LabeledImageSource {
    /// データセットのルートを走査する
    ///
    /// - サブディレクトリ（隠しディレクトリを除く）がちょうど2つであること
    /// - 各クラスに読み込める画像が1枚以上あること
    ///
    /// を満たさない場合は `Configuration` エラーになります。
    pub fn scan(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ClassifierError::Configuration(format!(
                "dataset root {} is not a directory",
                root.display()
            )));
        }

        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    ClassifierError::Configuration(format!("invalid class directory name: {}", path.display()))
                })?
                .to_string();
            if name.starts_with('.') {
                continue;
            }
            class_dirs.push((name, path));
        }
        class_dirs.sort();

        if class_dirs.len() != NUM_CLASSES {
            return Err(ClassifierError::Configuration(format!(
                "expected exactly {} class directories under {}, found {:?}",
                NUM_CLASSES,
                root.display(),
                class_dirs.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
            )));
        }

        let class_map = ClassIndexMapping::from_names(class_dirs.iter().map(|(n, _)| n.clone()))?;

        let mut samples = Vec::new();
        let mut skipped = Vec::new();
        for (label, (name, dir)) in class_dirs.iter().enumerate() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .collect();
            // read_dir の順序は不定なので並べ替えて列挙順を固定する
            files.sort();

            let mut count = 0usize;
            for path in files {
                match decode_image_path(&path) {
                    Ok(_) => {
                        samples.push(Sample { path, label });
                        count += 1;
                    }
                    Err(e) => {
                        tracing::warn!("画像を読み込めないためスキップします: {}", e);
                        skipped.push(path);
                    }
                }
            }

            if count == 0 {
                return Err(ClassifierError::Configuration(format!(
                    "class directory '{}' contains no readable images",
                    name
                )));
            }
            tracing::info!("  クラス {} '{}': {} 枚", label, name, count);
        }

        tracing::info!(
            "{} 枚の画像を読み込みました（スキップ {} 枚）",
            samples.len(),
            skipped.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            samples,
            class_map,
            skipped,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn class_map(&self) -> &ClassIndexMapping {
        &self.class_map
    }

    /// デコードに失敗してスキップしたファイル
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    pub fn class_count(&self, label: usize) -> usize {
        self.samples.iter().filter(|s| s.label == label).count()
    }

    /// クラスごとに層化して学習用・検証用に分割する
    ///
    /// 各クラスのインデックスをシードで並べ替え、`max(1, floor(n * train_ratio))` 件を学習用にします
    /// （1件しかないクラスは全て学習用）。検証用が空になった場合は学習用の最後の1件を移します。
    pub fn split(&self, train_ratio: f32, seed: u64) -> Result<DatasetSplit> {
        if !(train_ratio > 0.0 && train_ratio < 1.0) {
            return Err(ClassifierError::Configuration(format!(
                "train_ratio must be in (0, 1), got {}",
                train_ratio
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut val = Vec::new();

        for label in 0..self.class_map.len() {
            let mut indices: Vec<usize> = self
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.label == label)
                .map(|(i, _)| i)
                .collect();
            indices.shuffle(&mut rng);

            let n = indices.len();
            let cut = if n > 1 {
                ((n as f64 * train_ratio as f64 + 1e-6).floor() as usize).max(1)
            } else {
                n
            };
            train.extend(indices[..cut].iter().map(|&i| self.samples[i].clone()));
            val.extend(indices[cut..].iter().map(|&i| self.samples[i].clone()));
        }

        if val.is_empty() && train.len() > 1 {
            if let Some(moved) = train.pop() {
                val.push(moved);
            }
        }

        Ok(DatasetSplit {
            train: ImageSubset::new(train),
            val: ImageSubset::new(val),
        })
    }
}

/// 学習用・検証用の分割（実行中は固定）
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: ImageSubset,
    pub val: ImageSubset,
}

/// サンプルの部分集合
#[derive(Debug, Clone, Default)]
pub struct ImageSubset {
    samples: Vec<Sample>,
}

impl ImageSubset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl Dataset<Sample> for ImageSubset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{Rgb, RgbImage};
    use std::path::Path;

    /// クラスごとに単色に近い小さなPNGを書き出す
    pub fn write_images(dir: &Path, count: usize, base: [u8; 3]) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(16, 12, |x, y| {
                Rgb([
                    base[0].wrapping_add((x + i as u32) as u8),
                    base[1].wrapping_add(y as u8),
                    base[2],
                ])
            });
            img.save(dir.join(format!("img_{:02}.png", i))).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_images;
    use super::*;
    use std::collections::HashSet;

    fn dataset(cats: usize, not_cats: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("cats"), cats, [200, 120, 40]);
        write_images(&dir.path().join("not_cats"), not_cats, [20, 60, 220]);
        dir
    }

    #[test]
    fn test_scan_assigns_alphabetical_indices() {
        let dir = dataset(3, 2);
        let source = LabeledImageSource::scan(dir.path()).unwrap();

        assert_eq!(source.class_map().index_of("cats"), Some(0));
        assert_eq!(source.class_map().index_of("not_cats"), Some(1));
        assert_eq!(source.class_count(0), 3);
        assert_eq!(source.class_count(1), 2);
    }

    #[test]
    fn test_corrupt_files_are_skipped() {
        let dir = dataset(3, 2);
        std::fs::write(dir.path().join("cats/broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("not_cats/empty.png"), b"").unwrap();

        let source = LabeledImageSource::scan(dir.path()).unwrap();
        assert_eq!(source.samples().len(), 5);
        assert_eq!(source.skipped().len(), 2);
    }

    #[test]
    fn test_empty_class_is_configuration_error() {
        let dir = dataset(3, 0);
        std::fs::create_dir_all(dir.path().join("not_cats")).unwrap();
        let err = LabeledImageSource::scan(dir.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::Configuration(_)));
    }

    #[test]
    fn test_missing_class_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        write_images(&dir.path().join("cats"), 3, [1, 2, 3]);
        let err = LabeledImageSource::scan(dir.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::Configuration(_)));

        let err = LabeledImageSource::scan(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ClassifierError::Configuration(_)));
    }

    #[test]
    fn test_split_8_and_8_at_075() {
        let dir = dataset(8, 8);
        let source = LabeledImageSource::scan(dir.path()).unwrap();
        let split = source.split(0.75, 42).unwrap();

        assert_eq!(split.train.len(), 12);
        assert_eq!(split.val.len(), 4);
        assert_eq!(split.val.samples().iter().filter(|s| s.label == 0).count(), 2);

        let train: HashSet<_> = split.train.samples().iter().map(|s| s.path.clone()).collect();
        let val: HashSet<_> = split.val.samples().iter().map(|s| s.path.clone()).collect();
        assert!(train.is_disjoint(&val));
        assert_eq!(train.len() + val.len(), 16);
    }

    #[test]
    fn test_split_is_reproducible() {
        let dir = dataset(8, 8);
        let a = LabeledImageSource::scan(dir.path()).unwrap().split(0.75, 7).unwrap();
        let b = LabeledImageSource::scan(dir.path()).unwrap().split(0.75, 7).unwrap();

        assert_eq!(a.train.samples(), b.train.samples());
        assert_eq!(a.val.samples(), b.val.samples());
    }

    #[test]
    fn test_split_keeps_validation_non_empty() {
        let dir = dataset(1, 2);
        let split = LabeledImageSource::scan(dir.path()).unwrap().split(0.9, 1).unwrap();
        assert_eq!(split.train.len() + split.val.len(), 3);
        assert!(!split.val.is_empty());
    }

    #[test]
    fn test_split_rejects_bad_ratio() {
        let dir = dataset(2, 2);
        let source = LabeledImageSource::scan(dir.path()).unwrap();
        assert!(source.split(0.0, 1).is_err());
        assert!(source.split(1.0, 1).is_err());
    }
}
