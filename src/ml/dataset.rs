//! 画像フォルダのデータセットとバッチ生成
//!
//! `dataset_dir/<クラス名>/*.png` の構成から (画像パス, ラベル) を集め、
//! クラスごとにシード付きで学習用/検証用に分割する。
//! バッチはエポックごとに遅延生成し、画像のデコードはバッチ取得時に行う。

use anyhow::Result;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::ml::preprocess;
use crate::model::AugmentationSettings;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 画像フォルダのデータセット（パスのリストのみ保持）
#[derive(Clone, Debug)]
pub struct ImageFolderDataset {
    items: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// 指定された順序でディレクトリから画像を集める
    ///
    /// データセットディレクトリ・クラスディレクトリが無い場合や、
    /// 画像が1枚も無いクラスがある場合はエラー
    pub fn from_directory_with_order(data_dir: &Path, class_order: &[String]) -> Result<Self> {
        if !data_dir.is_dir() {
            anyhow::bail!("データセットディレクトリが存在しません: {}", data_dir.display());
        }

        let mut items = Vec::new();
        let mut empty_classes = Vec::new();

        // class_orderに従ってクラスIDを割り当て
        for (class_id, class_name) in class_order.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                anyhow::bail!("クラスディレクトリが存在しません: {}", class_dir.display());
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if is_image_file(&path) {
                    paths.push(path);
                }
            }
            // read_dirの順序はOS依存なのでソートして固定する
            paths.sort();

            if paths.is_empty() {
                empty_classes.push(class_name.clone());
            }
            tracing::info!("  クラス '{}': {} 枚", class_name, paths.len());

            items.extend(paths.into_iter().map(|path| ImageItem { path, label: class_id }));
        }

        if !empty_classes.is_empty() {
            anyhow::bail!(
                "以下のクラスディレクトリに画像が1枚もありません: {}",
                empty_classes.join(", ")
            );
        }

        Ok(Self {
            items,
            class_names: class_order.to_vec(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// クラスごとの枚数（クラス順）
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for item in &self.items {
            counts[item.label] += 1;
        }
        counts
    }

    /// データセットを学習用と検証用に分割
    ///
    /// クラスごとにシード付きでシャッフルし、先頭 `round(n * validation_split)` 枚を検証用にする。
    /// 検証用はクラス順 -> 分割順で並ぶので、毎回同じ順序になる。
    /// どちらかの側で0枚になるクラスがあればエラー。
    pub fn split(self, validation_split: f32, seed: u64) -> Result<(Self, Self)> {
        let mut train_items = Vec::new();
        let mut val_items = Vec::new();
        let mut rng = StdRng::seed_from_u64(seed);

        for (class_id, class_name) in self.class_names.iter().enumerate() {
            let mut class_items: Vec<ImageItem> = self
                .items
                .iter()
                .filter(|item| item.label == class_id)
                .cloned()
                .collect();
            class_items.shuffle(&mut rng);

            let n_val = (class_items.len() as f32 * validation_split).round() as usize;
            let n_train = class_items.len().saturating_sub(n_val);
            if n_val == 0 || n_train == 0 {
                anyhow::bail!(
                    "クラス '{}' の画像 {} 枚を分割すると学習用 {} 枚 / 検証用 {} 枚になります（各1枚以上必要）",
                    class_name,
                    class_items.len(),
                    n_train,
                    n_val
                );
            }

            let train_part = class_items.split_off(n_val);
            val_items.extend(class_items);
            train_items.extend(train_part);
        }

        let train = Self {
            items: train_items,
            class_names: self.class_names.clone(),
        };
        let val = Self {
            items: val_items,
            class_names: self.class_names,
        };
        Ok((train, val))
    }
}

/// ホストメモリ上のバッチ（正規化済み）
#[derive(Clone, Debug)]
pub struct HostBatch {
    /// [N, 3, size, size] を平坦化した画素値
    pub pixels: Vec<f32>,
    pub labels: Vec<usize>,
    pub paths: Vec<PathBuf>,
    pub image_size: usize,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// デバイス上のテンソルに変換（1回の転送でバッチ全体）
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> ImageBatch<B> {
        ImageBatch {
            images: self.images(device),
            targets: self.targets(device),
        }
    }

    /// 画像テンソル [N, 3, size, size]
    pub fn images<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let size = self.image_size;
        Tensor::<B, 1>::from_floats(self.pixels.as_slice(), device).reshape([
            self.len(),
            3,
            size,
            size,
        ])
    }

    /// ラベルテンソル [N, 1]
    pub fn targets<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2, Int> {
        let labels: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();
        Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device).reshape([self.len(), 1])
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

/// バッチ生成モード
#[derive(Clone, Debug, PartialEq)]
pub enum GeneratorMode {
    /// データ拡張あり、エポックごとにシャッフル
    Training(AugmentationSettings),
    /// 正規化のみ、順序固定
    Validation,
}

/// エポックごとにバッチを遅延生成するジェネレータ
#[derive(Clone, Debug)]
pub struct BatchGenerator {
    dataset: ImageFolderDataset,
    batch_size: usize,
    image_size: usize,
    mode: GeneratorMode,
    seed: u64,
}

impl BatchGenerator {
    pub fn new(
        dataset: ImageFolderDataset,
        batch_size: usize,
        image_size: usize,
        mode: GeneratorMode,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("バッチサイズは1以上である必要があります");
        }
        Ok(Self {
            dataset,
            batch_size,
            image_size,
            mode,
            seed,
        })
    }

    /// 学習用（データ拡張・シャッフルあり）
    pub fn training(
        dataset: ImageFolderDataset,
        batch_size: usize,
        image_size: usize,
        augmentation: AugmentationSettings,
        seed: u64,
    ) -> Result<Self> {
        Self::new(
            dataset,
            batch_size,
            image_size,
            GeneratorMode::Training(augmentation),
            seed,
        )
    }

    /// 検証用（正規化のみ、順序固定）
    pub fn validation(dataset: ImageFolderDataset, batch_size: usize, image_size: usize) -> Result<Self> {
        Self::new(dataset, batch_size, image_size, GeneratorMode::Validation, 0)
    }

    pub fn dataset(&self) -> &ImageFolderDataset {
        &self.dataset
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// 1エポックあたりのバッチ数
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// 検証順の正解ラベル
    pub fn labels(&self) -> Vec<usize> {
        self.dataset.items().iter().map(|item| item.label).collect()
    }

    /// 指定エポックのバッチ列（何度でも最初から作り直せる）
    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        if matches!(self.mode, GeneratorMode::Training(_)) {
            order.shuffle(&mut rng);
        }
        EpochBatches {
            generator: self,
            order,
            position: 0,
            rng,
        }
    }

    fn load_item(&self, item: &ImageItem, rng: &mut StdRng) -> Result<Vec<f32>> {
        let image = preprocess::open_image(&item.path)?;
        let resized = preprocess::resize_rgb(&image, self.image_size);
        let pixels = match &self.mode {
            GeneratorMode::Training(augmentation) => {
                preprocess::rgb_to_chw(&augmentation.augment(rng, &resized))
            }
            GeneratorMode::Validation => preprocess::rgb_to_chw(&resized),
        };
        Ok(pixels)
    }
}

/// 1エポック分のバッチイテレータ
pub struct EpochBatches<'a> {
    generator: &'a BatchGenerator,
    order: Vec<usize>,
    position: usize,
    rng: StdRng,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.generator.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;

        let size = self.generator.image_size;
        let mut batch = HostBatch {
            pixels: Vec::with_capacity(indices.len() * 3 * size * size),
            labels: Vec::with_capacity(indices.len()),
            paths: Vec::with_capacity(indices.len()),
            image_size: size,
        };

        for &index in indices {
            let item = &self.generator.dataset.items()[index];
            match self.generator.load_item(item, &mut self.rng) {
                Ok(pixels) => {
                    batch.pixels.extend_from_slice(&pixels);
                    batch.labels.push(item.label);
                    batch.paths.push(item.path.clone());
                }
                Err(e) => {
                    // 読み込めない画像は学習全体のエラー
                    self.position = self.order.len();
                    return Some(Err(e));
                }
            }
        }

        Some(Ok(batch))
    }
}
