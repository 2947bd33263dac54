//! モデル学習
//!
//! エポックループは2つの「ベスト」を独立に追跡する:
//! - val_loss 最小: 早期終了の判定と、終了時に復元する重み
//! - val_accuracy 最大: ディスクに保存するチェックポイント
//!
//! 状態遷移は [`TrainingMonitor`]、1エポック分の処理は [`EpochRunner`] が担当する。

use anyhow::{Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use serde::Serialize;
use std::path::PathBuf;

use crate::ml::checkpoint::save_checkpoint;
use crate::ml::dataset::{BatchGenerator, HostBatch};
use crate::ml::{ModelConfig, TumorClassifier};
use crate::model::{ModelMetadata, DECISION_THRESHOLD};

/// 1エポック分の指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    /// エポック番号（1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// エポック終了時の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochDecision {
    /// val_lossがベストを更新した（早期終了用の重みを保持する）
    pub loss_improved: bool,
    /// val_accuracyがベストを更新した（チェックポイントを書き出す）
    pub accuracy_improved: bool,
    /// patience回連続でval_lossが改善しなかった
    pub stop: bool,
}

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainingState {
    Training { epoch: usize },
    Completed,
    StoppedEarly { epoch: usize },
}

/// 早期終了とチェックポイントの判定
#[derive(Debug, Clone)]
pub struct TrainingMonitor {
    patience: usize,
    best_val_loss: f64,
    best_val_accuracy: f64,
    best_loss_epoch: Option<usize>,
    best_accuracy_epoch: Option<usize>,
    epochs_without_improvement: usize,
}

impl TrainingMonitor {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_val_loss: f64::INFINITY,
            best_val_accuracy: f64::NEG_INFINITY,
            best_loss_epoch: None,
            best_accuracy_epoch: None,
            epochs_without_improvement: 0,
        }
    }

    /// エポックの指標を反映して判定を返す（改善は厳密に大きい/小さい場合のみ）
    pub fn observe(&mut self, metrics: &EpochMetrics) -> EpochDecision {
        let loss_improved = metrics.val_loss < self.best_val_loss;
        if loss_improved {
            self.best_val_loss = metrics.val_loss;
            self.best_loss_epoch = Some(metrics.epoch);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }

        let accuracy_improved = metrics.val_accuracy > self.best_val_accuracy;
        if accuracy_improved {
            self.best_val_accuracy = metrics.val_accuracy;
            self.best_accuracy_epoch = Some(metrics.epoch);
        }

        EpochDecision {
            loss_improved,
            accuracy_improved,
            stop: self.patience > 0 && self.epochs_without_improvement >= self.patience,
        }
    }

    pub fn best_loss_epoch(&self) -> Option<usize> {
        self.best_loss_epoch
    }

    pub fn best_accuracy_epoch(&self) -> Option<usize> {
        self.best_accuracy_epoch
    }

    pub fn best_val_loss(&self) -> f64 {
        self.best_val_loss
    }

    pub fn best_val_accuracy(&self) -> f64 {
        self.best_val_accuracy
    }
}

/// 1エポック分の学習・検証と重みの保持/保存
pub trait EpochRunner {
    /// 学習データを1周して重みを更新し、(loss, accuracy) を返す
    fn train_epoch(&mut self, epoch: usize) -> Result<(f64, f64)>;

    /// 検証データを1周して (loss, accuracy) を返す（重みは更新しない）
    fn validate(&mut self, epoch: usize) -> Result<(f64, f64)>;

    /// 現在の重みを val_loss ベストとして保持する
    fn remember_best_loss_weights(&mut self, epoch: usize);

    /// 保持している val_loss ベストの重みに戻す（保持が無ければ何もしない）
    fn restore_best_loss_weights(&mut self) -> Result<()>;

    /// 現在の重みをチェックポイントとして書き出す
    fn save_checkpoint(&mut self, metrics: &EpochMetrics) -> Result<()>;
}

/// 学習結果
#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub history: Vec<EpochMetrics>,
    pub final_state: TrainingState,
    pub best_loss_epoch: Option<usize>,
    pub best_accuracy_epoch: Option<usize>,
    /// チェックポイントを書き出したエポック
    pub checkpoint_epochs: Vec<usize>,
}

/// エポックループを実行
pub fn run_epochs<R, F>(
    runner: &mut R,
    num_epochs: usize,
    patience: usize,
    mut progress_callback: F,
) -> Result<TrainingOutcome>
where
    R: EpochRunner,
    F: FnMut(&EpochMetrics),
{
    let mut monitor = TrainingMonitor::new(patience);
    let mut history = Vec::with_capacity(num_epochs);
    let mut checkpoint_epochs = Vec::new();
    let mut final_state = TrainingState::Completed;

    for epoch in 1..=num_epochs {
        let state = TrainingState::Training { epoch };
        tracing::debug!("状態: {:?}", state);

        let (train_loss, train_accuracy) = runner
            .train_epoch(epoch)
            .with_context(|| format!("エポック {} の学習に失敗しました", epoch))?;
        let (val_loss, val_accuracy) = runner
            .validate(epoch)
            .with_context(|| format!("エポック {} の検証に失敗しました", epoch))?;

        let metrics = EpochMetrics {
            epoch,
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
        };
        let decision = monitor.observe(&metrics);

        tracing::info!(
            "Epoch {:>3}/{} | loss={:.4} | accuracy={:.4} | val_loss={:.4} | val_accuracy={:.4}",
            epoch,
            num_epochs,
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy
        );

        if decision.loss_improved {
            runner.remember_best_loss_weights(epoch);
        }
        if decision.accuracy_improved {
            runner.save_checkpoint(&metrics)?;
            checkpoint_epochs.push(epoch);
            tracing::info!(
                "val_accuracy が {:.4} に改善したためチェックポイントを保存しました",
                val_accuracy
            );
        }

        history.push(metrics);
        progress_callback(&metrics);

        if decision.stop {
            tracing::info!(
                "val_loss が {} エポック改善しなかったため早期終了します（ベスト: エポック {}）",
                patience,
                monitor.best_loss_epoch().unwrap_or(0)
            );
            runner.restore_best_loss_weights()?;
            final_state = TrainingState::StoppedEarly { epoch };
            break;
        }
    }

    tracing::info!(
        "ベスト val_loss={:.4} (エポック {:?}), ベスト val_accuracy={:.4} (エポック {:?})",
        monitor.best_val_loss(),
        monitor.best_loss_epoch(),
        monitor.best_val_accuracy(),
        monitor.best_accuracy_epoch()
    );

    Ok(TrainingOutcome {
        history,
        final_state,
        best_loss_epoch: monitor.best_loss_epoch(),
        best_accuracy_epoch: monitor.best_accuracy_epoch(),
        checkpoint_epochs,
    })
}

/// 確率からしきい値で予測したときの正解数
pub fn count_correct(probabilities: &[f32], labels: &[usize]) -> usize {
    probabilities
        .iter()
        .zip(labels)
        .filter(|&(p, &label)| usize::from(*p > DECISION_THRESHOLD) == label)
        .count()
}

/// ロジットテンソルから確率をホストに取り出す
pub fn logits_to_probabilities<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<f32>> {
    sigmoid(logits)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
}

/// 損失・精度の集計（サンプル数で重み付け）
#[derive(Default)]
struct RunningMetrics {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl RunningMetrics {
    fn add(&mut self, batch_loss: f64, correct: usize, batch_len: usize) {
        self.loss_sum += batch_loss * batch_len as f64;
        self.correct += correct;
        self.samples += batch_len;
    }

    fn finish(&self) -> (f64, f64) {
        if self.samples == 0 {
            return (f64::NAN, 0.0);
        }
        (
            self.loss_sum / self.samples as f64,
            self.correct as f64 / self.samples as f64,
        )
    }
}

/// Burnによる1エポック分の処理
pub struct BurnEpochRunner<'a, B, O>
where
    B: AutodiffBackend,
    O: Optimizer<TumorClassifier<B>, B>,
{
    model: TumorClassifier<B>,
    optim: O,
    learning_rate: f64,
    device: B::Device,
    train: &'a BatchGenerator,
    val: &'a BatchGenerator,
    best_loss_model: Option<TumorClassifier<B>>,
    checkpoint_path: PathBuf,
    class_names: Vec<String>,
    model_config: ModelConfig,
}

impl<'a, B, O> BurnEpochRunner<'a, B, O>
where
    B: AutodiffBackend,
    O: Optimizer<TumorClassifier<B>, B>,
{
    /// 学習後のモデルを取り出す
    pub fn into_model(self) -> TumorClassifier<B> {
        self.model
    }

    fn train_batch(&mut self, batch: &HostBatch) -> Result<(f64, usize)> {
        let tensors = batch.to_tensors::<B>(&self.device);
        let (loss, logits) = self
            .model
            .forward_loss(tensors.images, tensors.targets, true);

        let batch_loss = loss.clone().into_scalar().elem::<f64>();
        let probabilities = logits_to_probabilities(logits.inner())?;
        let correct = count_correct(&probabilities, &batch.labels);

        // 逆伝播 + Adam更新
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optim.step(self.learning_rate, self.model.clone(), grads);

        Ok((batch_loss, correct))
    }
}

impl<B, O> EpochRunner for BurnEpochRunner<'_, B, O>
where
    B: AutodiffBackend,
    O: Optimizer<TumorClassifier<B>, B>,
{
    fn train_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let mut metrics = RunningMetrics::default();
        for batch in self.train.epoch(epoch) {
            let batch = batch?;
            let (loss, correct) = self.train_batch(&batch)?;
            metrics.add(loss, correct, batch.len());
        }
        Ok(metrics.finish())
    }

    fn validate(&mut self, _epoch: usize) -> Result<(f64, f64)> {
        // 検証は autodiff なしのバックエンドで実行
        let model_valid = self.model.valid();
        let mut metrics = RunningMetrics::default();

        for batch in self.val.epoch(0) {
            let batch = batch?;
            let tensors = batch.to_tensors::<B::InnerBackend>(&self.device);
            let (loss, logits) = model_valid.forward_loss(tensors.images, tensors.targets, false);
            let batch_loss = loss.into_scalar().elem::<f64>();
            let probabilities = logits_to_probabilities(logits)?;
            metrics.add(batch_loss, count_correct(&probabilities, &batch.labels), batch.len());
        }
        Ok(metrics.finish())
    }

    fn remember_best_loss_weights(&mut self, epoch: usize) {
        tracing::debug!("val_loss ベストの重みを保持: エポック {}", epoch);
        self.best_loss_model = Some(self.model.clone());
    }

    fn restore_best_loss_weights(&mut self) -> Result<()> {
        // val_lossが一度もベストにならなかった（NaNのみ等）場合は現在の重みを使う
        match self.best_loss_model.take() {
            Some(best) => {
                self.model = best;
                tracing::info!("val_loss ベストのエポックの重みを復元しました");
            }
            None => tracing::warn!("復元するval_lossベストの重みがないため現在の重みのまま続行します"),
        }
        Ok(())
    }

    fn save_checkpoint(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let metadata = ModelMetadata::new(
            self.class_names.clone(),
            self.model_config.image_size as u32,
            self.model_config.dropout,
            metrics.epoch as u32,
            metrics.val_loss,
            metrics.val_accuracy,
        );
        save_checkpoint(&self.checkpoint_path, &self.model.valid(), &metadata)
    }
}

/// 学習パラメータ
#[derive(Debug, Clone)]
pub struct TrainParams {
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub patience: usize,
    pub checkpoint_path: PathBuf,
    pub model_config: ModelConfig,
}

/// モデル学習を実行
///
/// 戻り値のモデルは早期終了した場合 val_loss ベストの重み、
/// ディスク上のチェックポイントは val_accuracy ベストの重みになる。
pub fn train_model<B, F>(
    params: &TrainParams,
    train: &BatchGenerator,
    val: &BatchGenerator,
    device: &B::Device,
    progress_callback: F,
) -> Result<(TumorClassifier<B>, TrainingOutcome)>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics),
{
    if train.image_size() != params.model_config.image_size
        || val.image_size() != params.model_config.image_size
    {
        anyhow::bail!(
            "ジェネレータの画像サイズ ({}, {}) がモデル入力サイズ {} と一致しません",
            train.image_size(),
            val.image_size(),
            params.model_config.image_size
        );
    }

    let model = params.model_config.init::<B>(device)?;
    params.model_config.log_summary(model.num_params());

    tracing::info!("学習を開始します...");
    tracing::info!(
        "エポック数: {}, 学習データ: {} 枚 ({} バッチ), 検証データ: {} 枚, 学習率: {}",
        params.num_epochs,
        train.len(),
        train.num_batches(),
        val.len(),
        params.learning_rate
    );

    let mut runner = BurnEpochRunner {
        model,
        optim: AdamConfig::new().init(),
        learning_rate: params.learning_rate,
        device: device.clone(),
        train,
        val,
        best_loss_model: None,
        checkpoint_path: params.checkpoint_path.clone(),
        class_names: train.dataset().class_names().to_vec(),
        model_config: params.model_config.clone(),
    };

    let outcome = run_epochs(
        &mut runner,
        params.num_epochs,
        params.patience,
        progress_callback,
    )?;

    match outcome.final_state {
        TrainingState::StoppedEarly { epoch } => {
            tracing::info!("学習終了: エポック {} で早期終了", epoch)
        }
        _ => tracing::info!("学習終了: 全 {} エポック完了", params.num_epochs),
    }

    Ok((runner.into_model(), outcome))
}
