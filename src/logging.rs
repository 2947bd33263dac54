//! ログ初期化

use tracing_subscriber::{fmt, EnvFilter};

/// 既定のログレベル（`RUST_LOG` で上書き可能）
const DEFAULT_FILTER: &str = "info";

/// グローバルな tracing subscriber を設定する
///
/// 既に設定済みの場合（テストから複数回呼ばれた場合など）は何もしない。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if fmt().with_env_filter(filter).with_target(false).try_init().is_err() {
        tracing::debug!("ログは既に初期化されています");
    }
}
