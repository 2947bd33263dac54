//! 小さな合成データセットでパイプライン全体を通すテスト（CPUバックエンド）

use burn::backend::{Autodiff, NdArray};
use burn_ndarray::NdArrayDevice;
use image::{Rgb, RgbImage};
use std::path::Path;

use tumor_classifier_lib::ml::{evaluate, parse_report_supports, InferenceError, InferenceService};
use tumor_classifier_lib::model::{load_metadata, AppConfig, DeviceType};
use tumor_classifier_lib::pipeline::prepare_generators;
use tumor_classifier_lib::{run_pipeline, Dashboard};

const SIZE: usize = 32;

fn write_class(dir: &Path, class: &str, count: u32, base: u8) {
    let class_dir = dir.join(class);
    std::fs::create_dir_all(&class_dir).unwrap();
    for i in 0..count {
        let img = RgbImage::from_fn(48, 40, |x, y| {
            let v = base.wrapping_add(((x + y + i) % 16) as u8);
            Rgb([v, v / 2, 255 - v])
        });
        img.save(class_dir.join(format!("img_{:02}.png", i))).unwrap();
    }
}

fn tiny_config(root: &Path) -> AppConfig {
    let dataset_dir = root.join("dataset");
    write_class(&dataset_dir, "Normal", 10, 20);
    write_class(&dataset_dir, "Tumor", 10, 200);

    let mut config = AppConfig::default();
    config.device_type = DeviceType::Cpu;
    config.dataset.dataset_dir = dataset_dir.display().to_string();
    config.model.model_path = root.join("best_model.tar.gz").display().to_string();
    config.model.image_size = SIZE;
    config.training.num_epochs = 2;
    config.training.batch_size = 4;
    config.report.report_path = root.join("classification_report.txt").display().to_string();
    config.report.summary_path = root.join("classification_summary.json").display().to_string();
    config
}

fn png_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[test]
fn test_pipeline_produces_checkpoint_and_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());

    let summary = run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu).unwrap();

    assert!(summary.model_path.exists());
    assert!(summary.report_path.exists());
    assert!(summary.summary_path.exists());
    assert!(!summary.outcome.history.is_empty());
    assert_eq!(summary.outcome.checkpoint_epochs.first(), Some(&1));

    let metadata = load_metadata(&summary.model_path).unwrap();
    assert_eq!(metadata.model_input_size as usize, SIZE);
    assert_eq!(metadata.class_names, vec!["Normal", "Tumor"]);

    // 検証データは各クラス round(10 * 0.2) = 2 枚
    let text = std::fs::read_to_string(&summary.report_path).unwrap();
    let supports = parse_report_supports(&text, &config.dataset.class_names);
    assert_eq!(supports["Normal"], 2);
    assert_eq!(supports["Tumor"], 2);
    assert_eq!(supports.values().sum::<usize>(), 4);
    assert_eq!(summary.evaluation.report.total_support, 4);
}

#[test]
fn test_evaluation_is_repeatable_and_dashboard_reads_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path());
    run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu).unwrap();

    let (_, val) = prepare_generators(&config).unwrap();
    let model_path = Path::new(&config.model.model_path);
    let first = InferenceService::<NdArray>::open(model_path, &NdArrayDevice::Cpu).unwrap();
    let second = InferenceService::<NdArray>::open(model_path, &NdArrayDevice::Cpu).unwrap();
    let a = evaluate(&first, &val).unwrap();
    let b = evaluate(&second, &val).unwrap();
    assert_eq!(a.confusion, b.confusion);
    assert_eq!(a.report.render(), b.report.render());

    let mut dashboard = Dashboard::<NdArray>::new(&config, NdArrayDevice::Cpu);
    assert!(dashboard.is_model_ready());

    let overview = dashboard.overview();
    assert_eq!(overview.total_samples, 4);
    assert_eq!(overview.image_size, SIZE);
    assert_eq!(overview.classes.len(), 2);

    let sample = Path::new(&config.dataset.dataset_dir).join("Tumor").join("img_00.png");
    let bytes = png_bytes(&sample);
    let image = image::open(&sample).unwrap();
    let single = dashboard.predict_one(&image).unwrap();
    let batch = dashboard
        .predict_batch(&[bytes.clone(), b"broken".to_vec(), bytes])
        .unwrap();

    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].as_ref().unwrap(), &single);
    assert!(matches!(batch[1], Err(InferenceError::UnreadableImage(_))));
    assert_eq!(batch[2].as_ref().unwrap(), &single);
    assert!((0.5..=1.0).contains(&single.confidence));

    // 拡張子が内容と違っても、読み込んだバイト列で分類できる
    let mislabeled = dir.path().join("upload.jpg");
    std::fs::copy(&sample, &mislabeled).unwrap();
    let renamed = dashboard.predict_batch(&[png_bytes(&mislabeled)]).unwrap();
    assert_eq!(renamed[0].as_ref().unwrap(), &single);
}

#[test]
fn test_pipeline_rejects_missing_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_config(dir.path());
    config.dataset.dataset_dir = dir.path().join("nowhere").display().to_string();

    assert!(run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu).is_err());
    assert!(!Path::new(&config.model.model_path).exists());
}

#[test]
fn test_pipeline_rejects_tiny_input_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_config(dir.path());
    config.model.image_size = 16;

    assert!(run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu).is_err());
}
