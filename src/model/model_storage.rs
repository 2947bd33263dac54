//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズなど）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! 書き込みは同じディレクトリの一時ファイルに行ってからリネームするため、
//! 読み込み側が書きかけのファイルを見ることはありません。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

/// ファイルをアトミックに置き換える（一時ファイルに書いてからリネーム）
pub fn write_file_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temp file in {:?}", parent))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to move temp file to {:?}: {}", path, e.error))?;
    Ok(())
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    // Gzip圧縮を設定
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    // メタデータをJSONとして追加
    let json_str = metadata.to_json_string()?;
    let json_bytes = json_str.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_path("metadata.json")?;
    header.set_size(json_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder
        .append(&header, json_bytes)
        .context("Failed to add metadata.json to tar")?;

    // モデルバイナリを追加
    let mut header = tar::Header::new_gnu();
    header.set_path("model.bin")?;
    header.set_size(model_binary.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder
        .append(&header, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    let archive_bytes = encoder.finish().context("Failed to finalize gzip stream")?;

    write_file_atomic(output_path, &archive_bytes)
        .with_context(|| format!("Failed to write checkpoint: {:?}", output_path))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    // metadata.jsonを探す
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some("metadata.json") {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    // 両方のファイルを読み込む
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some("metadata.json") => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some("model.bin") => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("クラス: {}", metadata.class_names.join(", "));
    tracing::info!(
        "モデル入力サイズ: {}x{}",
        metadata.model_input_size,
        metadata.model_input_size
    );
    tracing::info!(
        "保存エポック: {} (val_loss={:.4}, val_accuracy={:.4})",
        metadata.epoch,
        metadata.val_loss,
        metadata.val_accuracy
    );
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata(epoch: u32) -> ModelMetadata {
        ModelMetadata::new(
            vec!["Normal".to_string(), "Tumor".to_string()],
            224,
            0.5,
            epoch,
            0.3,
            0.9,
        )
    }

    #[test]
    fn test_save_and_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");
        let binary = vec![1u8, 2, 3, 4, 5];

        save_model_with_metadata(&path, &sample_metadata(2), &binary).unwrap();

        let (metadata, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(metadata.epoch, 2);
        assert_eq!(loaded, binary);
        assert_eq!(load_metadata(&path).unwrap().class_names, metadata.class_names);
    }

    #[test]
    fn test_overwrite_replaces_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");

        save_model_with_metadata(&path, &sample_metadata(1), &[0u8; 16]).unwrap();
        save_model_with_metadata(&path, &sample_metadata(3), &[7u8; 8]).unwrap();

        let (metadata, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(metadata.epoch, 3);
        assert_eq!(loaded, vec![7u8; 8]);

        // 一時ファイルが残っていないこと
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model_with_metadata(&dir.path().join("nope.tar.gz")).is_err());
    }

    #[test]
    fn test_atomic_write_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.txt");
        write_file_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }
}
