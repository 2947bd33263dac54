//! 学習パイプライン
//!
//! データセット読み込み -> 分割 -> 学習 -> ベストモデルで評価 -> レポート出力

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};

use crate::ml::{
    evaluate, train_model, write_report_artifacts, BatchGenerator, Evaluation, ImageFolderDataset,
    InferenceService, ModelConfig, TrainParams, TrainingOutcome,
};
use crate::model::{print_metadata_info, AppConfig};

/// パイプラインの実行結果
#[derive(Debug)]
pub struct PipelineSummary {
    pub outcome: TrainingOutcome,
    pub evaluation: Evaluation,
    pub model_path: PathBuf,
    pub report_path: PathBuf,
    pub summary_path: PathBuf,
}

/// データセットを読み込み、学習用と検証用のジェネレータを作る
pub fn prepare_generators(config: &AppConfig) -> Result<(BatchGenerator, BatchGenerator)> {
    let dataset_dir = Path::new(&config.dataset.dataset_dir);
    let dataset = ImageFolderDataset::from_directory_with_order(dataset_dir, &config.dataset.class_names)
        .with_context(|| format!("データセットを読み込めません: {}", dataset_dir.display()))?;

    tracing::info!("画像総数: {} 枚", dataset.len());

    let (train, val) = dataset.split(config.training.validation_split, config.training.seed)?;
    tracing::info!("学習データ: {} 枚, 検証データ: {} 枚", train.len(), val.len());

    let train = BatchGenerator::training(
        train,
        config.training.batch_size,
        config.model.image_size,
        config.augmentation.clone(),
        config.training.seed,
    )?;
    let val = BatchGenerator::validation(val, config.training.batch_size, config.model.image_size)?;
    Ok((train, val))
}

/// 学習から評価・レポート出力までを実行
pub fn run_pipeline<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<PipelineSummary> {
    config.validate()?;
    config.display();

    let (train, val) = prepare_generators(config)?;

    let model_path = PathBuf::from(&config.model.model_path);
    let params = TrainParams {
        num_epochs: config.training.num_epochs,
        learning_rate: config.training.learning_rate,
        patience: config.training.patience,
        checkpoint_path: model_path.clone(),
        model_config: ModelConfig::new()
            .with_image_size(config.model.image_size)
            .with_dropout(config.model.dropout),
    };

    let (_model, outcome) = train_model::<B, _>(&params, &train, &val, device, |metrics| {
        tracing::debug!("進捗: {:?}", metrics);
    })?;

    // 評価はディスク上のベストモデル（val_accuracy最大）で行う
    let service = InferenceService::<B::InnerBackend>::open(&model_path, device)?;
    print_metadata_info(service.metadata());
    service.config().print_info();

    let evaluation = evaluate(&service, &val)?;
    tracing::info!("=== 混同行列（行: 正解, 列: 予測）===");
    for line in evaluation.confusion.render_table().lines() {
        tracing::info!("{}", line);
    }
    evaluation.report.log();

    let report_path = PathBuf::from(&config.report.report_path);
    let summary_path = PathBuf::from(&config.report.summary_path);
    write_report_artifacts(&evaluation, &report_path, &summary_path)?;

    tracing::info!("==============================================");
    tracing::info!("学習完了: モデルを保存しました: {}", model_path.display());
    tracing::info!("検証精度: {:.4}", evaluation.report.accuracy);
    tracing::info!("==============================================");

    Ok(PipelineSummary {
        outcome,
        evaluation,
        model_path,
        report_path,
        summary_path,
    })
}
