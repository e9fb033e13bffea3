//! エポックメトリクスの記録
//!
//! 1エポックにつき1行のJSON（JSONL）を追記します。学習実行ごとに1ファイルです。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 1エポック分のメトリクス（精度は0〜1の割合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    /// 記録時刻（RFC3339）
    pub timestamp: String,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train_loss: f64, train_acc: f64, val_loss: f64, val_acc: f64) -> Self {
        Self {
            epoch,
            train_loss,
            train_acc,
            val_loss,
            val_acc,
            timestamp: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// 追記専用のメトリクスログ
#[derive(Debug)]
pub struct MetricsLog {
    path: PathBuf,
    file: File,
}

impl MetricsLog {
    /// ログファイルを新規作成する（既存の内容は破棄）
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1レコードを追記してディスクへ書き出す
    pub fn append(&mut self, record: &EpochMetrics) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// ログファイルの全レコードを読み込む
    pub fn read_all(path: &Path) -> Result<Vec<EpochMetrics>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
