//! チェックポイントの永続化
//!
//! Tar.gz形式でモデル重みとメタデータを1ファイルに統合して保存・読み込みします。
//! クラスマッピングは別ファイル（JSON）にも書き出し、読み込み時に両者の一致を確認します。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（構造、クラスマッピング、検証メトリクスなど）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! どのファイルも一時ファイルに書き込んでからリネームするため、
//! 読み込み側が書きかけのファイルを観測することはありません。

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{ClassifierError, Result};
use crate::model::class_map::ClassIndexMapping;
use crate::model::model_metadata::CheckpointMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 一時ファイルに書き込んでからリネームする
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;
    Ok(())
}

/// メタデータと重みを tar.gz にまとめたバイト列を作る
fn encode_artifact(metadata: &CheckpointMetadata, model_binary: &[u8]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    let encoder = tar_builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// チェックポイントを保存する
///
/// クラスマッピングファイルを先に書き、続いてアーティファクトを置き換えます。
/// どちらも一時ファイル経由のリネームで書き込みます。
pub fn save_checkpoint(
    artifact_path: &Path,
    class_map_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
) -> Result<()> {
    let archive = encode_artifact(metadata, model_binary)?;
    metadata.class_to_idx.save(class_map_path)?;
    write_atomic(artifact_path, &archive)?;
    Ok(())
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| {
        ClassifierError::ModelNotLoaded(format!(
            "checkpoint {} is not readable: {}",
            tar_gz_path.display(),
            e
        ))
    })?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// 読み込みエラーを `ModelNotLoaded` にまとめる
fn not_loaded(path: &Path, e: ClassifierError) -> ClassifierError {
    match e {
        ClassifierError::ModelNotLoaded(_) => e,
        other => ClassifierError::ModelNotLoaded(format!("{} is corrupt: {}", path.display(), other)),
    }
}

/// Tar.gzからメタデータとモデルバイナリを共に読み込む
///
/// 壊れた・途中までしかないアーカイブも `ModelNotLoaded` になります。
pub fn load_artifact(tar_gz_path: &Path) -> Result<(CheckpointMetadata, Vec<u8>)> {
    read_artifact(tar_gz_path).map_err(|e| not_loaded(tar_gz_path, e))
}

fn read_artifact(tar_gz_path: &Path) -> Result<(CheckpointMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<CheckpointMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(CheckpointMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(ClassifierError::ModelNotLoaded(format!(
            "{} not found in {}",
            METADATA_ENTRY,
            tar_gz_path.display()
        ))),
        (_, None) => Err(ClassifierError::ModelNotLoaded(format!(
            "{} not found in {}",
            MODEL_ENTRY,
            tar_gz_path.display()
        ))),
    }
}

/// Tar.gzからメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<CheckpointMetadata> {
    load_artifact(tar_gz_path).map(|(metadata, _)| metadata)
}

/// チェックポイントとクラスマッピングファイルを対で読み込む
///
/// マッピングファイルの内容がアーティファクト内のマッピングと異なる場合は、
/// 別の学習実行で作られた組み合わせとみなして `ModelNotLoaded` を返します。
pub fn load_checkpoint(
    artifact_path: &Path,
    class_map_path: &Path,
) -> Result<(CheckpointMetadata, Vec<u8>, ClassIndexMapping)> {
    let (metadata, binary) = load_artifact(artifact_path)?;
    let mapping = ClassIndexMapping::load(class_map_path).map_err(|e| not_loaded(class_map_path, e))?;

    if mapping != metadata.class_to_idx {
        return Err(ClassifierError::ModelNotLoaded(format!(
            "class index mapping {} ({:?}) does not match checkpoint {} ({:?})",
            class_map_path.display(),
            mapping.names(),
            artifact_path.display(),
            metadata.class_to_idx.names()
        )));
    }

    Ok((metadata, binary, mapping))
}
