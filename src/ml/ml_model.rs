//! 機械学習モデルの共通定義
//!
//! 腫瘍/正常の二値分類用CNNモデルと関連する設定を提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::BinaryCrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::sigmoid, backend::Backend, Int, Tensor},
};

/// 画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// クラス名の定義（ラベル番号順: 0 = Normal, 1 = Tumor）
pub const CLASS_NAMES: [&str; 2] = ["Normal", "Tumor"];

/// 全結合層の幅
const HIDDEN_UNITS: usize = 128;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl ModelConfig {
    /// 3ブロック通過後の特徴マップの一辺
    ///
    /// Conv (3x3, no padding): size -> size - 2
    /// Pool (2x2, stride 2):   size -> size / 2 (切り捨て)
    ///
    /// 特徴マップが消える入力サイズの場合は `None`
    pub fn feature_map_size(image_size: usize) -> Option<usize> {
        let mut size = image_size;
        for _ in 0..3 {
            size = size.checked_sub(2)? / 2;
        }
        (size > 0).then_some(size)
    }

    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> Option<usize> {
        Self::feature_map_size(self.image_size).map(|f| 128 * f * f)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TumorClassifier<B>> {
        let d = self.flattened_features().ok_or_else(|| {
            anyhow::anyhow!("入力サイズが小さすぎます: {} (最小22x22が必要)", self.image_size)
        })?;

        Ok(TumorClassifier {
            conv1: Conv2dConfig::new([3, 32], [3, 3]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: Conv2dConfig::new([64, 128], [3, 3]).init(device),
            pool3: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(HIDDEN_UNITS, 1).init(device),
            activation: Relu::new(),
        })
    }

    /// 各層の出力サイズをログに出力（model.summary 相当）
    pub fn log_summary(&self, num_params: usize) {
        let mut size = self.image_size;
        tracing::info!("[Model] 入力: 3 x {}x{}", size, size);
        for (block, channels) in [32usize, 64, 128].iter().enumerate() {
            let conv = size.saturating_sub(2);
            size = conv / 2;
            tracing::info!(
                "[Model] Block{}: Conv3x3 -> {} x {}x{}, MaxPool -> {}x{}",
                block + 1,
                channels,
                conv,
                conv,
                size,
                size
            );
        }
        tracing::info!("[Model] Flatten: {}", self.flattened_features().unwrap_or(0));
        tracing::info!("[Model] Dense: {} + ReLU, Dropout({})", HIDDEN_UNITS, self.dropout);
        tracing::info!("[Model] Dense: 1 + Sigmoid");
        tracing::info!(
            "[Model] 総パラメータ数: {} ({:.2}M)",
            num_params,
            num_params as f64 / 1_000_000.0
        );
    }
}

/// 腫瘍分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (no padding) + ReLU + MaxPool 2x2} x 3層 (32 -> 64 -> 128)
/// - Flatten
/// - FC: d -> 128 + ReLU
/// - Dropout (学習時のみ)
/// - FC: 128 -> 1 (ロジット、Sigmoidで P(Tumor))
#[derive(Module, Debug)]
pub struct TumorClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,

    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> TumorClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `training`: trueのときのみドロップアウトを適用
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>, training: bool) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.pool1.forward(self.activation.forward(x));

        let x = self.conv2.forward(x);
        let x = self.pool2.forward(self.activation.forward(x));

        let x = self.conv3.forward(x);
        let x = self.pool3.forward(self.activation.forward(x));

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = if training { self.dropout.forward(x) } else { x };

        self.fc2.forward(x)
    }

    /// 推論モードで陽性クラス確率を計算
    ///
    /// # 戻り値
    /// - P(Tumor) [batch_size]
    pub fn forward_probability(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch_size, _, _, _] = images.dims();
        sigmoid(self.forward(images, false)).reshape([batch_size])
    }

    /// 順伝播と損失計算
    ///
    /// # 引数
    /// - `targets`: ターゲットラベル [batch_size, 1] (0 or 1)
    ///
    /// # 戻り値
    /// - (二値交差エントロピー損失, ロジット)
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 2, Int>,
        training: bool,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let logits = self.forward(images, training);
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), targets);
        (loss, logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_map_size() {
        // 224 -> 222 -> 111 -> 109 -> 54 -> 52 -> 26
        assert_eq!(ModelConfig::feature_map_size(224), Some(26));
        assert_eq!(ModelConfig::feature_map_size(32), Some(2));
        assert_eq!(ModelConfig::feature_map_size(22), Some(1));
        assert_eq!(ModelConfig::feature_map_size(21), None);
        assert_eq!(ModelConfig::feature_map_size(1), None);
    }

    #[test]
    fn test_default_config_matches_contract() {
        let config = ModelConfig::new();
        assert_eq!(config.image_size, IMAGE_SIZE);
        assert_eq!(config.dropout, 0.5);
        assert_eq!(config.flattened_features(), Some(128 * 26 * 26));
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let device = Default::default();
        let result = ModelConfig::new().with_image_size(16).init::<TestBackend>(&device);
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_shapes_and_probability_range() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();

        let images = Tensor::<TestBackend, 4>::ones([3, 3, 32, 32], &device);
        let logits = model.forward(images.clone(), false);
        assert_eq!(logits.dims(), [3, 1]);

        let probs = model
            .forward_probability(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(probs.len(), 3);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_inference_mode_is_deterministic() {
        let device = Default::default();
        let model = ModelConfig::new()
            .with_image_size(32)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device).mul_scalar(0.5);

        let a = model.forward(images.clone(), false).into_data().to_vec::<f32>().unwrap();
        let b = model.forward(images, false).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
