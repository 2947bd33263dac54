//! テキスト版ダッシュボード
//!
//! 使い方: `dashboard [画像パス...]`
//! 画像パスを渡すと分類結果を表示する。

use burn::backend::{NdArray, Wgpu};
use burn::tensor::backend::Backend;
use burn_ndarray::NdArrayDevice;
use burn_wgpu::WgpuDevice;
use std::path::PathBuf;
use tumor_classifier_lib::model::{AppConfig, DeviceType};
use tumor_classifier_lib::{logging, Dashboard};

fn main() -> anyhow::Result<()> {
    logging::init();

    let config = AppConfig::load_or_default()?;
    let images: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();

    match config.device_type {
        DeviceType::Wgpu => run(Dashboard::<Wgpu>::new(&config, WgpuDevice::default()), &images),
        DeviceType::Cpu => run(Dashboard::<NdArray>::new(&config, NdArrayDevice::Cpu), &images),
    }
    Ok(())
}

fn run<B: Backend>(mut dashboard: Dashboard<B>, images: &[PathBuf]) {
    println!("=== Dashboard ===\n");
    let overview = dashboard.overview();
    if overview.model_ready {
        println!("モデル: 準備完了 ({})", dashboard.model_path().display());
    } else {
        println!(
            "モデル: 未準備 ({} を読み込めません。先に学習を実行してください)",
            dashboard.model_path().display()
        );
    }
    println!("クラス数: {}", overview.num_classes);
    println!("入力サイズ: {}x{}", overview.image_size, overview.image_size);
    println!("検証サンプル数: {}", overview.total_samples);
    for class in &overview.classes {
        let bar = "#".repeat((class.proportion * 40.0).round() as usize);
        println!(
            "  {:<8} {:>6}  {:>6.2}%  {}",
            class.class_name,
            class.support,
            class.proportion * 100.0,
            bar
        );
    }

    if !images.is_empty() {
        println!("\n{}\n", "=".repeat(50));
        println!("=== Prediction ===\n");
        // 拡張子ではなく内容から形式を判定するため、バイト列のまま渡す
        let mut readable = Vec::new();
        let mut contents = Vec::new();
        for path in images {
            match std::fs::read(path) {
                Ok(bytes) => {
                    readable.push(path);
                    contents.push(bytes);
                }
                Err(e) => eprintln!("✗ {}: {}", path.display(), e),
            }
        }

        match dashboard.predict_batch(&contents) {
            Ok(results) => {
                for (path, result) in readable.iter().zip(results) {
                    match result {
                        Ok(prediction) => println!(
                            "✓ {}: {} (確信度 {:.2}%, P(Tumor)={:.4})",
                            path.display(),
                            prediction.label,
                            prediction.confidence * 100.0,
                            prediction.probability
                        ),
                        Err(e) => eprintln!("✗ {}: {}", path.display(), e),
                    }
                }
            }
            Err(e) => eprintln!("✗ {}", e),
        }
    }

    println!("\n{}\n", "=".repeat(50));
    println!("=== Report ===\n");
    match dashboard.read_report_text() {
        Some(text) => println!("{}", text),
        None => println!("レポートがありません。先に学習を実行してください"),
    }
}
