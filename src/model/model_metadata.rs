//! モデルメタデータの定義
//!
//! チェックポイント（tar.gz）内に `metadata.json` として保存され、
//! 推論時にモデル構造と前処理を学習時と同一に復元するために使用します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（ラベル番号順）
    /// 例: ["Normal", "Tumor"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    /// 推論時の前処理はこの値で行う
    pub model_input_size: u32,

    /// 学習時のドロップアウト率（推論時は無効）
    pub dropout: f64,

    /// この重みを保存したエポック（1始まり）
    pub epoch: u32,

    /// 保存時の検証損失
    pub val_loss: f64,

    /// 保存時の検証精度
    pub val_accuracy: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        model_input_size: u32,
        dropout: f64,
        epoch: u32,
        val_loss: f64,
        val_accuracy: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            model_input_size,
            dropout,
            epoch,
            val_loss,
            val_accuracy,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_keeps_class_order() {
        let metadata = ModelMetadata::new(
            vec!["Normal".to_string(), "Tumor".to_string()],
            224,
            0.5,
            3,
            0.41,
            0.875,
        );
        let json = metadata.to_json_string().unwrap();
        let parsed = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed.class_names, vec!["Normal", "Tumor"]);
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_rejects_invalid_json() {
        assert!(ModelMetadata::from_json_string("{ not json").is_err());
    }
}
