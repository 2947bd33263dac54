//! ダッシュボード
//!
//! モデルの状態確認、画像の分類、評価レポートの参照をまとめた窓口。
//! 書き込みは一切行わない。

use burn::tensor::backend::Backend;
use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ml::{parse_report_supports, InferenceError, ModelCache, Prediction, ReportSummary};
use crate::model::AppConfig;

/// クラスごとの件数と割合
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassShare {
    pub class_name: String,
    pub support: usize,
    pub proportion: f64,
}

/// ダッシュボード画面の表示内容
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardOverview {
    pub model_ready: bool,
    pub num_classes: usize,
    pub image_size: usize,
    pub total_samples: usize,
    pub classes: Vec<ClassShare>,
}

pub struct Dashboard<B: Backend> {
    cache: ModelCache<B>,
    class_names: Vec<String>,
    image_size: usize,
    report_path: PathBuf,
    summary_path: PathBuf,
}

impl<B: Backend> Dashboard<B> {
    pub fn new(config: &AppConfig, device: B::Device) -> Self {
        Self {
            cache: ModelCache::new(&config.model.model_path, device),
            class_names: config.dataset.class_names.clone(),
            image_size: config.model.image_size,
            report_path: PathBuf::from(&config.report.report_path),
            summary_path: PathBuf::from(&config.report.summary_path),
        }
    }

    pub fn model_path(&self) -> &Path {
        self.cache.model_path()
    }

    /// チェックポイントを読み込めるか（壊れたファイルは未準備）
    pub fn is_model_ready(&mut self) -> bool {
        self.cache.is_model_ready()
    }

    pub fn predict_one(&mut self, image: &DynamicImage) -> Result<Prediction, InferenceError> {
        self.cache.get()?.predict_one(image)
    }

    /// 画像をまとめて分類（モデルが読めない場合のみ全体がエラー）
    pub fn predict_batch<T>(&mut self, inputs: &[T]) -> Result<Vec<Result<Prediction, InferenceError>>, InferenceError>
    where
        T: AsRef<[u8]> + Sync,
    {
        Ok(self.cache.get()?.predict_batch(inputs))
    }

    /// クラスごとの support を読む
    ///
    /// JSONサマリーを優先し、無ければテキストレポートを解析する。
    /// どちらも無い場合は空のマップ。
    pub fn read_report_summary(&self) -> BTreeMap<String, usize> {
        if self.summary_path.exists() {
            match ReportSummary::load(&self.summary_path) {
                Ok(summary) => return summary.supports,
                Err(e) => tracing::warn!("サマリーを読めないためテキストレポートを使用します: {:#}", e),
            }
        }

        match self.read_report_text() {
            Some(text) => parse_report_supports(&text, &self.class_names),
            None => BTreeMap::new(),
        }
    }

    /// テキストレポートの内容
    pub fn read_report_text(&self) -> Option<String> {
        std::fs::read_to_string(&self.report_path).ok()
    }

    /// ダッシュボード画面の表示内容を集計
    pub fn overview(&mut self) -> DashboardOverview {
        // 入力サイズは学習済みモデルのメタデータを優先
        let (model_ready, image_size) = match self.cache.get() {
            Ok(service) => (true, service.image_size()),
            Err(_) => (false, self.image_size),
        };

        let supports = self.read_report_summary();
        let total_samples: usize = supports.values().sum();
        let classes = self
            .class_names
            .iter()
            .filter_map(|name| supports.get(name).map(|&support| (name, support)))
            .map(|(name, support)| ClassShare {
                class_name: name.clone(),
                support,
                proportion: if total_samples == 0 {
                    0.0
                } else {
                    support as f64 / total_samples as f64
                },
            })
            .collect();

        DashboardOverview {
            model_ready,
            num_classes: self.class_names.len(),
            image_size,
            total_samples,
            classes,
        }
    }
}
