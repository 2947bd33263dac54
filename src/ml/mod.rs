pub mod ml_model;
pub mod preprocess;
pub mod augment;
pub mod dataset;
pub mod checkpoint;
pub mod training;
pub mod evaluation;
pub mod inference;

pub use ml_model::{ModelConfig, TumorClassifier, CLASS_NAMES, IMAGE_SIZE};
pub use preprocess::{normalize_bytes, normalize_image, normalize_path};
pub use dataset::{BatchGenerator, HostBatch, ImageFolderDataset};
pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use training::{run_epochs, train_model, EpochMetrics, EpochRunner, TrainParams, TrainingMonitor, TrainingOutcome, TrainingState};
pub use evaluation::{evaluate, parse_report_supports, write_report_artifacts, ClassificationReport, ConfusionMatrix, Evaluation, ReportSummary};
pub use inference::{InferenceError, InferenceService, ModelCache, Prediction};
