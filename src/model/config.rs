//! アプリケーション設定管理モジュール
//!
//! データセット、モデル、学習、レポート出力の設定をJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::{CLASS_NAMES, IMAGE_SIZE};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// クラスごとのサブディレクトリを持つルートディレクトリ
    pub dataset_dir: String,
    /// クラス名（この順序がラベル番号になる。アルファベット順ではない）
    pub class_names: Vec<String>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            dataset_dir: "src/dataset_dir/Label".to_string(),
            class_names: CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// ベストモデル（チェックポイント）のパス
    pub model_path: String,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "best_model.tar.gz".to_string(),
            image_size: IMAGE_SIZE,
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 最大エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（分割・シャッフル・データ拡張）
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f32,
    /// val_lossが改善しないエポックを何回まで許容するか
    pub patience: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 32,
            learning_rate: 1e-4,
            seed: 42,
            validation_split: 0.2,
            patience: 5,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentationSettings {
    /// 回転範囲（度、±）
    pub rotation_range: f32,
    /// 横方向シフト（幅に対する割合、±）
    pub width_shift_range: f32,
    /// 縦方向シフト（高さに対する割合、±）
    pub height_shift_range: f32,
    /// ズーム範囲（1.0 ± zoom_range）
    pub zoom_range: f32,
    /// ランダム左右反転
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

impl AugmentationSettings {
    /// 恒等変換になる設定
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
        }
    }
}

/// 評価レポートの出力先
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSettings {
    /// テキスト形式の分類レポート
    pub report_path: String,
    /// ダッシュボード用の構造化サマリー（JSON）
    pub summary_path: String,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            report_path: "classification_report.txt".to_string(),
            summary_path: "classification_summary.json".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    #[serde(default)]
    pub report: ReportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの形式が不正です: {}", path.display()))?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_or_default_from(Self::default_path())
    }

    /// 指定パスから設定を読み込む
    ///
    /// ファイルが無ければデフォルト設定、あるのに読めない場合はエラー。
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Ok(Self::default());
        }
        let config = Self::load(path)?;
        tracing::info!("設定ファイルを読み込みました: {}", path.display());
        Ok(config)
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習開始前に設定値の整合性を検証する
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dataset.class_names.len() != 2 {
            anyhow::bail!(
                "二値分類のためクラス名は2つ必要です: {:?}",
                self.dataset.class_names
            );
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("バッチサイズは1以上である必要があります");
        }
        if self.training.num_epochs == 0 {
            anyhow::bail!("エポック数は1以上である必要があります");
        }
        let split = self.training.validation_split;
        if !(split > 0.0 && split < 1.0) {
            anyhow::bail!("validation_splitは0と1の間である必要があります: {}", split);
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            anyhow::bail!("ドロップアウト率は0以上1未満である必要があります: {}", self.model.dropout);
        }
        if crate::ml::ModelConfig::feature_map_size(self.model.image_size).is_none() {
            anyhow::bail!("入力サイズが小さすぎます: {}", self.model.image_size);
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("データセット: {}", self.dataset.dataset_dir);
        tracing::info!("クラス: {}", self.dataset.class_names.join(", "));
        tracing::info!("モデルパス: {}", self.model.model_path);
        tracing::info!("入力サイズ: {}x{}", self.model.image_size, self.model.image_size);
        tracing::info!("ドロップアウト率: {}", self.model.dropout);
        tracing::info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed
        );
        tracing::info!(
            "検証データ割合: {}, patience: {}",
            self.training.validation_split,
            self.training.patience
        );
        tracing::info!("レポート: {} / {}", self.report.report_path, self.report.summary_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.dataset.class_names, vec!["Normal", "Tumor"]);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.training.num_epochs, 20);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.training.patience, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.device_type, deserialized.device_type);
        assert_eq!(config.model.model_path, deserialized.model.model_path);
        assert_eq!(config.augmentation, deserialized.augmentation);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "device_type": "Cpu", "training": { "num_epochs": 3, "batch_size": 4,
            "learning_rate": 0.001, "seed": 7, "validation_split": 0.25, "patience": 2 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.model.image_size, 224);
        assert_eq!(config.report.report_path, "classification_report.txt");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.validation_split = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.image_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default_from(dir.path().join("missing.json")).unwrap();
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "training": { "num_epochs": "many" "#).unwrap();

        assert!(AppConfig::load(&path).is_err());
        let err = AppConfig::load_or_default_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("形式が不正"));

        // 正しい内容に直せば読み込める
        AppConfig::default().save(&path).unwrap();
        assert!(AppConfig::load_or_default_from(&path).is_ok());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
