//! 検証データでの評価とレポート出力
//!
//! - 混同行列（行 = 正解、列 = 予測）
//! - scikit-learn の `classification_report(digits=4)` と同じ体裁のテキスト
//! - ダッシュボードが読む構造化サマリー（JSON）

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::ml::dataset::BatchGenerator;
use crate::ml::InferenceService;
use crate::model::write_file_atomic;

/// 混同行列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    class_names: Vec<String>,
    /// counts[正解][予測]
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(class_names: Vec<String>) -> Self {
        let n = class_names.len();
        Self {
            class_names,
            counts: vec![vec![0; n]; n],
        }
    }

    /// 正解ラベルと予測ラベルの列から作成
    pub fn from_predictions(class_names: Vec<String>, y_true: &[usize], y_pred: &[usize]) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            anyhow::bail!(
                "正解と予測の数が一致しません: {} != {}",
                y_true.len(),
                y_pred.len()
            );
        }
        let mut matrix = Self::new(class_names);
        for (&actual, &predicted) in y_true.iter().zip(y_pred) {
            matrix.add(actual, predicted)?;
        }
        Ok(matrix)
    }

    pub fn add(&mut self, actual: usize, predicted: usize) -> Result<()> {
        let n = self.class_names.len();
        if actual >= n || predicted >= n {
            anyhow::bail!("ラベルが範囲外です: 正解 {}, 予測 {} (クラス数 {})", actual, predicted, n);
        }
        self.counts[actual][predicted] += 1;
        Ok(())
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// 正解がクラス `class` のサンプル数
    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// クラス `class` と予測されたサンプル数
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.class_names.len()).map(|i| self.counts[i][i]).sum()
    }

    /// ログ出力用のテキスト表
    pub fn render_table(&self) -> String {
        let width = self
            .class_names
            .iter()
            .map(String::len)
            .chain(std::iter::once("true \\ pred".len()))
            .max()
            .unwrap_or(0);
        let cell = self
            .counts
            .iter()
            .flatten()
            .map(|c| c.to_string().len())
            .chain(self.class_names.iter().map(String::len))
            .max()
            .unwrap_or(1);

        let mut table = String::new();
        let _ = write!(table, "{:>width$}", "true \\ pred", width = width);
        for name in &self.class_names {
            let _ = write!(table, "  {:>cell$}", name, cell = cell);
        }
        table.push('\n');
        for (name, row) in self.class_names.iter().zip(&self.counts) {
            let _ = write!(table, "{:>width$}", name, width = width);
            for count in row {
                let _ = write!(table, "  {:>cell$}", count, cell = cell);
            }
            table.push('\n');
        }
        table
    }
}

/// クラスごと（または平均）の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// 0除算は0.0
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// 分類レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub class_names: Vec<String>,
    pub per_class: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    pub total_support: usize,
}

impl ClassificationReport {
    pub fn from_confusion(matrix: &ConfusionMatrix) -> Self {
        let per_class: Vec<ClassMetrics> = (0..matrix.class_names().len())
            .map(|i| {
                let tp = matrix.get(i, i);
                let precision = ratio(tp, matrix.predicted(i));
                let recall = ratio(tp, matrix.support(i));
                let f1_score = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    precision,
                    recall,
                    f1_score,
                    support: matrix.support(i),
                }
            })
            .collect();

        let total_support = matrix.total();
        let n = per_class.len().max(1) as f64;
        let mean = |f: fn(&ClassMetrics) -> f64| per_class.iter().map(f).sum::<f64>() / n;
        let weighted = |f: fn(&ClassMetrics) -> f64| {
            if total_support == 0 {
                0.0
            } else {
                per_class.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total_support as f64
            }
        };

        let macro_avg = ClassMetrics {
            precision: mean(|m| m.precision),
            recall: mean(|m| m.recall),
            f1_score: mean(|m| m.f1_score),
            support: total_support,
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1_score: weighted(|m| m.f1_score),
            support: total_support,
        };

        Self {
            class_names: matrix.class_names().to_vec(),
            accuracy: ratio(matrix.correct(), total_support),
            per_class,
            macro_avg,
            weighted_avg,
            total_support,
        }
    }

    /// クラス名 -> support
    pub fn supports(&self) -> BTreeMap<String, usize> {
        self.class_names
            .iter()
            .cloned()
            .zip(self.per_class.iter().map(|m| m.support))
            .collect()
    }

    /// テキスト形式に整形（小数4桁、1列目がクラス名、最終列が support）
    pub fn render(&self) -> String {
        let width = self
            .class_names
            .iter()
            .map(String::len)
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        );
        out.push('\n');

        let row = |out: &mut String, name: &str, m: &ClassMetrics| {
            let _ = writeln!(
                out,
                "{:>width$}  {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name,
                m.precision,
                m.recall,
                m.f1_score,
                m.support,
                width = width
            );
        };

        for (name, metrics) in self.class_names.iter().zip(&self.per_class) {
            row(&mut out, name, metrics);
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "{:>width$}  {:>9} {:>9} {:>9.4} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total_support,
            width = width
        );
        row(&mut out, "macro avg", &self.macro_avg);
        row(&mut out, "weighted avg", &self.weighted_avg);
        out
    }

    pub fn log(&self) {
        tracing::info!("=== 分類レポート ===");
        for line in self.render().lines() {
            tracing::info!("{}", line);
        }
    }
}

/// テキストレポートからクラスごとの support を読み取る
///
/// 空白区切りで5要素以上あり、先頭がクラス名の行だけを対象にする。
pub fn parse_report_supports(text: &str, class_names: &[String]) -> BTreeMap<String, usize> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 || !class_names.iter().any(|c| c == parts[0]) {
                return None;
            }
            let support = parts.last()?.parse::<usize>().ok()?;
            Some((parts[0].to_string(), support))
        })
        .collect()
}

/// ダッシュボード用の構造化サマリー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub generated_at: String,
    pub class_names: Vec<String>,
    pub supports: BTreeMap<String, usize>,
    pub total_support: usize,
    pub accuracy: f64,
    pub per_class: BTreeMap<String, ClassMetrics>,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl ReportSummary {
    pub fn new(report: &ClassificationReport, matrix: &ConfusionMatrix) -> Self {
        Self {
            generated_at: chrono::Local::now().to_rfc3339(),
            class_names: report.class_names.clone(),
            supports: report.supports(),
            total_support: report.total_support,
            accuracy: report.accuracy,
            per_class: report
                .class_names
                .iter()
                .cloned()
                .zip(report.per_class.iter().copied())
                .collect(),
            macro_avg: report.macro_avg,
            weighted_avg: report.weighted_avg,
            confusion_matrix: matrix.counts().to_vec(),
        }
    }

    /// JSONファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("サマリーを読み込めません: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("サマリーの形式が不正です: {}", path.display()))
    }
}

/// 評価結果
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
}

/// 検証データ全体を1回推論して評価
pub fn evaluate<B: Backend>(service: &InferenceService<B>, generator: &BatchGenerator) -> Result<Evaluation> {
    if generator.image_size() != service.image_size() {
        anyhow::bail!(
            "検証データの画像サイズ {} がモデル入力サイズ {} と一致しません",
            generator.image_size(),
            service.image_size()
        );
    }

    let config = service.config();
    let mut y_true = Vec::with_capacity(generator.len());
    let mut y_pred = Vec::with_capacity(generator.len());

    for batch in generator.epoch(0) {
        let batch = batch?;
        let probabilities = service.probabilities(&batch.pixels, batch.len())?;
        y_pred.extend(probabilities.iter().map(|&p| config.class_index_for_probability(p)));
        y_true.extend_from_slice(&batch.labels);
    }

    let confusion = ConfusionMatrix::from_predictions(config.class_names.clone(), &y_true, &y_pred)?;
    let report = ClassificationReport::from_confusion(&confusion);
    Ok(Evaluation { confusion, report })
}

/// テキストレポートとサマリーJSONを書き出す
pub fn write_report_artifacts(evaluation: &Evaluation, report_path: &Path, summary_path: &Path) -> Result<()> {
    write_file_atomic(report_path, evaluation.report.render().as_bytes())
        .with_context(|| format!("レポートを書き出せません: {}", report_path.display()))?;

    let summary = ReportSummary::new(&evaluation.report, &evaluation.confusion);
    let json = serde_json::to_string_pretty(&summary)?;
    write_file_atomic(summary_path, json.as_bytes())
        .with_context(|| format!("サマリーを書き出せません: {}", summary_path.display()))?;

    tracing::info!("分類レポートを保存しました: {}", report_path.display());
    tracing::info!("サマリーを保存しました: {}", summary_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["Normal".to_string(), "Tumor".to_string()]
    }

    fn sample_matrix() -> ConfusionMatrix {
        // Normal: 8正解 2誤り, Tumor: 1誤り 4正解
        let y_true = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let y_pred = [0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 1, 1, 1, 1];
        ConfusionMatrix::from_predictions(names(), &y_true, &y_pred).unwrap()
    }

    #[test]
    fn test_confusion_matrix_layout() {
        let matrix = sample_matrix();
        assert_eq!(matrix.counts(), &[vec![8, 2], vec![1, 4]]);
        assert_eq!(matrix.support(0), 10);
        assert_eq!(matrix.predicted(0), 9);
        assert_eq!(matrix.total(), 15);
    }

    #[test]
    fn test_out_of_range_label_is_rejected() {
        let mut matrix = ConfusionMatrix::new(names());
        assert!(matrix.add(2, 0).is_err());
        assert!(ConfusionMatrix::from_predictions(names(), &[0, 1], &[0]).is_err());
    }

    #[test]
    fn test_report_metrics() {
        let report = ClassificationReport::from_confusion(&sample_matrix());
        let normal = report.per_class[0];
        assert!((normal.precision - 8.0 / 9.0).abs() < 1e-12);
        assert!((normal.recall - 0.8).abs() < 1e-12);
        assert_eq!(normal.support, 10);
        assert!((report.accuracy - 12.0 / 15.0).abs() < 1e-12);
        assert_eq!(report.macro_avg.support, 15);
        let expected_weighted = (0.8 * 10.0 + 0.8 * 5.0) / 15.0;
        assert!((report.weighted_avg.recall - expected_weighted).abs() < 1e-12);
    }

    #[test]
    fn test_zero_division_yields_zero() {
        // Tumor と一度も予測されない
        let matrix = ConfusionMatrix::from_predictions(names(), &[0, 1], &[0, 0]).unwrap();
        let report = ClassificationReport::from_confusion(&matrix);
        assert_eq!(report.per_class[1].precision, 0.0);
        assert_eq!(report.per_class[1].f1_score, 0.0);
    }

    #[test]
    fn test_render_layout() {
        let text = ClassificationReport::from_confusion(&sample_matrix()).render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "              precision    recall  f1-score   support"
        );
        assert_eq!(lines[1], "");
        assert_eq!(
            lines[2],
            "      Normal     0.8889    0.8000    0.8421        10"
        );
        assert_eq!(
            lines[5],
            "    accuracy                         0.8000        15"
        );
        assert!(lines[7].starts_with("weighted avg"));
    }

    #[test]
    fn test_rendered_report_parses_back_to_supports() {
        let report = ClassificationReport::from_confusion(&sample_matrix());
        let supports = parse_report_supports(&report.render(), &names());
        assert_eq!(supports.get("Normal"), Some(&10));
        assert_eq!(supports.get("Tumor"), Some(&5));
        assert_eq!(supports.values().sum::<usize>(), 15);
        assert_eq!(supports, report.supports());
    }

    #[test]
    fn test_parse_ignores_unrelated_lines() {
        let text = "Normal 1 2\nmacro avg 0.1 0.2 0.3 9\nTumor x y z 7\n";
        let supports = parse_report_supports(text, &names());
        assert_eq!(supports.len(), 1);
        assert_eq!(supports["Tumor"], 7);
    }

    #[test]
    fn test_artifacts_written_and_summary_loads() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("classification_report.txt");
        let summary_path = dir.path().join("classification_summary.json");
        let confusion = sample_matrix();
        let evaluation = Evaluation {
            report: ClassificationReport::from_confusion(&confusion),
            confusion,
        };

        write_report_artifacts(&evaluation, &report_path, &summary_path).unwrap();

        let text = std::fs::read_to_string(&report_path).unwrap();
        assert_eq!(text, evaluation.report.render());
        let summary = ReportSummary::load(&summary_path).unwrap();
        assert_eq!(summary.total_support, 15);
        assert_eq!(summary.confusion_matrix, vec![vec![8, 2], vec![1, 4]]);
        assert_eq!(summary.supports, evaluation.report.supports());
    }

    #[test]
    fn test_table_contains_counts() {
        let table = sample_matrix().render_table();
        assert!(table.contains("true \\ pred"));
        assert_eq!(table.lines().count(), 3);
    }
}
