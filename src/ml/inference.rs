//! モデル推論機能
//!
//! チェックポイントから復元したモデルで1枚またはまとめて画像を分類する。
//! 学習時と同じ前処理（[`crate::ml::preprocess`]）を通し、
//! 入力サイズはチェックポイントのメタデータから決まる。

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::ml::checkpoint::load_checkpoint;
use crate::ml::preprocess::{normalize_bytes, normalize_image, open_image};
use crate::ml::TumorClassifier;
use crate::model::{InferenceConfig, ModelMetadata};

/// 推論時のエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("モデルファイルが見つかりません: {}（先に学習を実行してください）", .path.display())]
    ModelNotReady { path: PathBuf },

    #[error("画像を読み込めません: {0}")]
    UnreadableImage(String),

    #[error("チェックポイントを読み込めません: {0}")]
    Checkpoint(String),

    #[error("推論に失敗しました: {0}")]
    Inference(String),
}

/// 分類結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 予測ラベル（"Normal" または "Tumor"）
    pub label: String,
    /// 予測ラベルの確信度 max(p, 1 - p)
    pub confidence: f32,
    /// P(Tumor)
    pub probability: f32,
}

impl Prediction {
    /// 陽性クラス確率から分類結果を作る
    pub fn from_probability(probability: f32, config: &InferenceConfig) -> Result<Self, InferenceError> {
        let index = config.class_index_for_probability(probability);
        let label = config
            .class_index_to_label(index)
            .ok_or_else(|| {
                InferenceError::Inference(format!("クラスインデックス {} に対応するラベルがありません", index))
            })?
            .to_string();

        Ok(Self {
            label,
            confidence: probability.max(1.0 - probability),
            probability,
        })
    }
}

/// 推論サービス
pub struct InferenceService<B: Backend> {
    model: TumorClassifier<B>,
    config: InferenceConfig,
    metadata: ModelMetadata,
    device: B::Device,
    model_path: PathBuf,
}

impl<B: Backend> InferenceService<B> {
    /// チェックポイントを読み込んで推論サービスを初期化
    pub fn open(model_path: &Path, device: &B::Device) -> Result<Self, InferenceError> {
        if !model_path.exists() {
            return Err(InferenceError::ModelNotReady {
                path: model_path.to_path_buf(),
            });
        }

        let loaded = load_checkpoint::<B>(model_path, device)
            .map_err(|e| InferenceError::Checkpoint(format!("{:#}", e)))?;

        tracing::info!(
            "モデルを読み込みました: {} (エポック {}, val_accuracy={:.4})",
            model_path.display(),
            loaded.metadata.epoch,
            loaded.metadata.val_accuracy
        );

        Ok(Self {
            model: loaded.model,
            config: loaded.config,
            metadata: loaded.metadata,
            device: device.clone(),
            model_path: model_path.to_path_buf(),
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// モデル入力サイズ
    pub fn image_size(&self) -> usize {
        self.config.model_input_size
    }

    /// 正規化済み画素から P(Tumor) を計算
    ///
    /// `pixels` は [count, 3, size, size] を平坦化したもの
    pub fn probabilities(&self, pixels: &[f32], count: usize) -> Result<Vec<f32>, InferenceError> {
        let size = self.image_size();
        let expected = count * 3 * size * size;
        if pixels.len() != expected {
            return Err(InferenceError::Inference(format!(
                "入力の要素数が不正です: {} (期待値 {})",
                pixels.len(),
                expected
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let images = Tensor::<B, 1>::from_floats(pixels, &self.device).reshape([count, 3, size, size]);
        self.model
            .forward_probability(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Inference(format!("{:?}", e)))
    }

    /// 正規化済みの1枚を分類
    fn predict_normalized(&self, pixels: &[f32]) -> Result<Prediction, InferenceError> {
        let probability = self
            .probabilities(pixels, 1)?
            .first()
            .copied()
            .ok_or_else(|| InferenceError::Inference("推論結果が空です".to_string()))?;
        Prediction::from_probability(probability, &self.config)
    }

    /// デコード済み画像を分類
    pub fn predict_one(&self, image: &DynamicImage) -> Result<Prediction, InferenceError> {
        self.predict_normalized(&normalize_image(image, self.image_size()))
    }

    /// エンコード済み画像（アップロードされたファイル内容など）を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, InferenceError> {
        let pixels = normalize_bytes(bytes, self.image_size())
            .map_err(|e| InferenceError::UnreadableImage(format!("{:#}", e)))?;
        self.predict_normalized(&pixels)
    }

    /// 画像ファイルを分類
    pub fn predict_path(&self, path: &Path) -> Result<Prediction, InferenceError> {
        let image = open_image(path).map_err(|e| InferenceError::UnreadableImage(format!("{:#}", e)))?;
        self.predict_one(&image)
    }

    /// 複数画像をまとめて分類
    ///
    /// 入力1つにつき結果1つを入力順で返す。デコードできない画像はその要素だけ
    /// `UnreadableImage` になり、他の画像の処理は続く。
    /// デコードと前処理はスレッドで並列に行い、順伝播は1枚ずつ行う。
    pub fn predict_batch<T>(&self, inputs: &[T]) -> Vec<Result<Prediction, InferenceError>>
    where
        T: AsRef<[u8]> + Sync,
    {
        if inputs.is_empty() {
            return Vec::new();
        }

        let size = self.image_size();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(inputs.len());
        let chunk_size = inputs.len().div_ceil(workers);

        let normalized: Vec<Result<Vec<f32>, InferenceError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .chunks(chunk_size)
                .map(|chunk| {
                    let handle = scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|bytes| {
                                normalize_bytes(bytes.as_ref(), size)
                                    .map_err(|e| InferenceError::UnreadableImage(format!("{:#}", e)))
                            })
                            .collect::<Vec<_>>()
                    });
                    (chunk.len(), handle)
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|(len, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        vec![Err(InferenceError::Inference("前処理スレッドが異常終了しました".to_string())); len]
                    })
                })
                .collect()
        });

        normalized
            .into_iter()
            .map(|pixels| pixels.and_then(|pixels| self.predict_normalized(&pixels)))
            .collect()
    }
}

/// 推論サービスのキャッシュ
///
/// 最初の利用時にチェックポイントを読み込み、以降は同じインスタンスを返す。
/// モデルがまだ無い場合は次回の利用時に再度読み込みを試みる。
pub struct ModelCache<B: Backend> {
    model_path: PathBuf,
    device: B::Device,
    service: Option<Arc<InferenceService<B>>>,
}

impl<B: Backend> ModelCache<B> {
    pub fn new(model_path: impl Into<PathBuf>, device: B::Device) -> Self {
        Self {
            model_path: model_path.into(),
            device,
            service: None,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// モデルパスを変更（変わった場合のみキャッシュを破棄）
    pub fn set_model_path(&mut self, model_path: impl Into<PathBuf>) {
        let model_path = model_path.into();
        if model_path != self.model_path {
            self.model_path = model_path;
            self.service = None;
        }
    }

    /// モデルを読み込んで推論できる状態か
    ///
    /// ファイルがあっても読み込めない（壊れている）場合は準備未完了とみなす。
    pub fn is_model_ready(&mut self) -> bool {
        match self.get() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("モデル未準備: {}", e);
                false
            }
        }
    }

    /// 読み込み済みか
    pub fn is_loaded(&self) -> bool {
        self.service.is_some()
    }

    /// 推論サービスを取得（未読み込みなら読み込む）
    pub fn get(&mut self) -> Result<Arc<InferenceService<B>>, InferenceError> {
        if let Some(service) = &self.service {
            return Ok(Arc::clone(service));
        }

        let service = Arc::new(InferenceService::open(&self.model_path, &self.device)?);
        self.service = Some(Arc::clone(&service));
        Ok(service)
    }
}
