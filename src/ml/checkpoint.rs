//! チェックポイントの保存・読み込み
//!
//! 重みは `BinBytesRecorder` (f32精度) でバイナリ化し、メタデータと一緒に
//! tar.gz にまとめて保存する。

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::Path;

use crate::ml::TumorClassifier;
use crate::model::{load_model_with_metadata, save_model_with_metadata, InferenceConfig, ModelMetadata};

/// 読み込んだチェックポイント
#[derive(Debug)]
pub struct LoadedCheckpoint<B: Backend> {
    pub model: TumorClassifier<B>,
    pub metadata: ModelMetadata,
    pub config: InferenceConfig,
}

/// モデルの重みをバイナリに変換
pub fn model_to_bytes<B: Backend>(model: &TumorClassifier<B>) -> Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// モデルとメタデータをチェックポイントとして保存
pub fn save_checkpoint<B: Backend>(
    path: &Path,
    model: &TumorClassifier<B>,
    metadata: &ModelMetadata,
) -> Result<()> {
    let binary = model_to_bytes(model)?;
    save_model_with_metadata(path, metadata, &binary)
}

/// チェックポイントを読み込んでモデルを復元
pub fn load_checkpoint<B: Backend>(path: &Path, device: &B::Device) -> Result<LoadedCheckpoint<B>> {
    let (metadata, binary) = load_model_with_metadata(path)?;
    let config = InferenceConfig::from_metadata(&metadata);

    // メタデータの入力サイズでモデルを組み立ててから重みを流し込む
    let model = config.model_config().init::<B>(device)?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok(LoadedCheckpoint {
        model: model.load_record(record),
        metadata,
        config,
    })
}
