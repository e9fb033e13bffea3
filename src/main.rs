//! 猫判定器のコマンドラインツール
//!
//! - `train`: データセットから学習し、ベストチェックポイントを書き出す
//! - `predict`: 1枚の画像を分類する
//! - `info`: チェックポイントのメタデータを表示する

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, Subcommand};

use cat_classifier_lib::logging::{init_logging, LogConfig};
use cat_classifier_lib::ml::{train_model, InferenceEngine, TrainingReport};
use cat_classifier_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};

/// 猫 / 猫以外の画像分類器
#[derive(Parser, Debug)]
#[command(name = "cat_classifier")]
#[command(version)]
#[command(about = "Cat / not-cat image classifier (ResNet-18 transfer learning with Burn)", long_about = None)]
struct Cli {
    /// 詳細ログを出力する
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// 設定ファイル（JSON）
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// データセットから学習する
    Train {
        /// データセットのルート（クラスごとのサブディレクトリを含む）
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// エポック数
        #[arg(short, long)]
        epochs: Option<usize>,

        /// バッチサイズ
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// 学習率
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// 学習データの割合（0〜1）
        #[arg(long)]
        train_ratio: Option<f32>,

        /// ランダムシード
        #[arg(long)]
        seed: Option<u64>,

        /// バックボーンを固定してヘッドのみ学習する
        #[arg(long, default_value = "false")]
        freeze_backbone: bool,

        /// 事前学習済みバックボーンの重み（Burnレコード）
        #[arg(long)]
        pretrained: Option<PathBuf>,

        /// チェックポイントの出力先
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// メトリクスログ（JSONL）の出力先
        #[arg(long)]
        log: Option<PathBuf>,

        /// GPU（WGPU）で学習する
        #[arg(long, default_value = "false")]
        gpu: bool,
    },

    /// 1枚の画像を分類する
    Predict {
        /// 画像ファイル
        image: PathBuf,

        /// チェックポイント（省略時は設定ファイルの値）
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// クラスマッピング（省略時は設定ファイルの値）
        #[arg(long)]
        class_map: Option<PathBuf>,

        /// 結果をJSONで出力する
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// チェックポイントのメタデータを表示する
    Info {
        /// チェックポイント（省略時は設定ファイルの値）
        model: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config)?;

    let mut config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Train {
            data_dir,
            epochs,
            batch_size,
            learning_rate,
            train_ratio,
            seed,
            freeze_backbone,
            pretrained,
            output,
            log,
            gpu,
        } => {
            if let Some(v) = data_dir {
                config.training.data_dir = v;
            }
            if let Some(v) = epochs {
                config.training.num_epochs = v;
            }
            if let Some(v) = batch_size {
                config.training.batch_size = v;
            }
            if let Some(v) = learning_rate {
                config.training.learning_rate = v;
            }
            if let Some(v) = train_ratio {
                config.training.train_ratio = v;
            }
            if let Some(v) = seed {
                config.training.seed = v;
            }
            if freeze_backbone {
                config.model.freeze_backbone = true;
            }
            if pretrained.is_some() {
                config.model.pretrained_backbone = pretrained;
            }
            if let Some(v) = output {
                config.model.checkpoint_path = v;
            }
            if let Some(v) = log {
                config.training.log_path = v;
            }
            if gpu {
                config.device_type = DeviceType::Wgpu;
            }
            run_train(&config)
        }
        Commands::Predict {
            image,
            model,
            class_map,
            json,
        } => {
            let artifact = model.unwrap_or_else(|| config.model.checkpoint_path.clone());
            let class_map = class_map.unwrap_or_else(|| config.model.class_map_path.clone());
            run_predict(&artifact, &class_map, &image, json)
        }
        Commands::Info { model } => {
            let artifact = model.unwrap_or_else(|| config.model.checkpoint_path.clone());
            let metadata = load_metadata(&artifact)
                .with_context(|| format!("チェックポイントを読み込めません: {}", artifact.display()))?;
            print_metadata_info(&metadata);
            Ok(())
        }
    }
}

fn run_train(config: &AppConfig) -> Result<()> {
    config.display();
    tracing::info!("計算デバイス: {}", config.device_type);

    let report: TrainingReport = match config.device_type {
        DeviceType::Wgpu => train_model::<Autodiff<Wgpu>>(config, &WgpuDevice::default())?,
        DeviceType::Cpu => train_model::<Autodiff<NdArray<f32>>>(config, &NdArrayDevice::Cpu)?,
    };

    println!("\n学習完了:");
    println!("  エポック数: {}", report.epochs.len());
    println!("  ベストエポック: {}", report.best_epoch);
    println!("  チェックポイント更新: {} 回", report.checkpoints_written);
    println!("  チェックポイント: {}", config.model.checkpoint_path.display());
    println!("  メトリクスログ: {}", config.training.log_path.display());
    Ok(())
}

fn run_predict(artifact: &Path, class_map: &Path, image: &Path, json: bool) -> Result<()> {
    let engine = InferenceEngine::<NdArray<f32>>::load(artifact, class_map, &NdArrayDevice::Cpu)?;
    let prediction = engine.predict_path(image)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    } else {
        println!("{}: {} ({:.2}%)", image.display(), prediction.label, prediction.confidence * 100.0);
    }
    Ok(())
}
