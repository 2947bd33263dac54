//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータから、モデル構造の復元と
//! 確率からクラスラベルへの変換に必要な情報を取得します。

use crate::ml::ModelConfig;
use crate::model::model_metadata::ModelMetadata;

/// 陽性クラス（Tumor）と判定する確率のしきい値
pub const DECISION_THRESHOLD: f32 = 0.5;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラス名（0 = 陰性, 1 = 陽性）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub model_input_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            model_input_size: metadata.model_input_size as usize,
        }
    }

    /// 推論用のモデル設定（ドロップアウトは推論時に使われない）
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new().with_image_size(self.model_input_size)
    }

    /// クラス数を取得
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 確率（陽性クラス）からクラスインデックスを取得
    pub fn class_index_for_probability(&self, probability: f32) -> usize {
        usize::from(probability > DECISION_THRESHOLD)
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// 設定情報をログに出力
    pub fn print_info(&self) {
        tracing::info!("=== 推論設定 ===");
        tracing::info!("クラス: {}", self.class_names.join(", "));
        tracing::info!(
            "モデル入力サイズ: {}x{}",
            self.model_input_size,
            self.model_input_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> InferenceConfig {
        InferenceConfig {
            class_names: vec!["Normal".to_string(), "Tumor".to_string()],
            model_input_size: 224,
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let config = config();
        assert_eq!(config.class_index_for_probability(0.5), 0);
        assert_eq!(config.class_index_for_probability(0.5001), 1);
        assert_eq!(config.class_index_for_probability(0.0), 0);
        assert_eq!(config.class_index_for_probability(1.0), 1);
    }

    #[test]
    fn test_label_lookup() {
        let config = config();
        assert_eq!(config.class_index_to_label(0), Some("Normal"));
        assert_eq!(config.class_index_to_label(1), Some("Tumor"));
        assert_eq!(config.class_index_to_label(2), None);
    }
}
