//! ログ出力の初期化
//!
//! `tracing` のサブスクライバを設定します。エポックごとの学習メトリクスは
//! ここではなく `ml::metrics` のJSONLログに書き出されます。

use tracing_subscriber::EnvFilter;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 最小ログレベル（"info", "debug" など、EnvFilter の書式も可）
    pub level: String,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使用するか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用の詳細設定
    pub fn verbose() -> Self {
        Self {
            level: "debug".to_string(),
            include_target: true,
            ansi_colors: true,
        }
    }
}

/// グローバルなサブスクライバを設定する
///
/// `RUST_LOG` が設定されている場合はそちらを優先します。
/// 2回目以降の呼び出しはエラーを返します（テストから複数回呼ばれても問題ない）。
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target)
        .with_ansi(config.ansi_colors)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
