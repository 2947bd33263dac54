//! 学習パイプライン
//!
//! カレントディレクトリの `config.json`（無ければデフォルト設定）で
//! 学習・評価・レポート出力を行う。壊れた設定ファイルはエラーで終了する。

use anyhow::Result;
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use tumor_classifier_lib::model::{AppConfig, DeviceType};
use tumor_classifier_lib::{logging, run_pipeline, PipelineSummary};

fn main() -> Result<()> {
    logging::init();

    let config = AppConfig::load_or_default()?;
    tracing::info!("計算デバイス: {}", config.device_type);

    let summary: PipelineSummary = match config.device_type {
        DeviceType::Wgpu => run_pipeline::<Autodiff<Wgpu>>(&config, &WgpuDevice::default())?,
        DeviceType::Cpu => run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu)?,
    };

    tracing::info!(
        "エポック数: {}, 最終状態: {:?}, チェックポイント保存: {:?}",
        summary.outcome.history.len(),
        summary.outcome.final_state,
        summary.outcome.checkpoint_epochs
    );
    tracing::info!("レポート: {}", summary.report_path.display());
    Ok(())
}
