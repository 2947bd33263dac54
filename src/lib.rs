//! 腫瘍/正常 画像分類
//!
//! - [`pipeline`]: 学習から評価レポート出力まで
//! - [`dashboard`]: 学習済みモデルでの分類とレポート参照
//! - [`ml`]: モデル・前処理・データセット・学習・評価・推論
//! - [`model`]: 設定とチェックポイントの保存形式

pub mod model;
pub mod ml;
pub mod logging;
pub mod pipeline;
pub mod dashboard;

pub use dashboard::{Dashboard, DashboardOverview};
pub use pipeline::{run_pipeline, PipelineSummary};
