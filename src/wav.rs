use crate::types::Sample;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// RIFF/WAVE ヘッダの固定サイズ（バイト）
///
/// これより短いファイルは破損として拒否する
const WAV_HEADER_SIZE: u64 = 44;

/// 正規化サンプルを 16bit 整数に変換
///
/// `round(sample * 32767)` を 16bit 符号付き範囲にクランプする
fn to_i16(sample: Sample) -> i16 {
    (sample * 32767.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// 発話 WAV ファイルの書き出し先パスを生成
///
/// `utt_YYYYmmdd_HHMMSS_mmm.wav` 形式のタイムスタンプ付きファイル名。
pub fn utterance_wav_path<P: AsRef<Path>>(output_dir: P) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
    output_dir.as_ref().join(format!("utt_{}.wav", timestamp))
}

/// サンプル列を WAV ファイルとして保存
///
/// 16bit PCM モノラル。出力ディレクトリが無ければ作成する。
///
/// # Errors
///
/// ディレクトリ作成またはファイル書き込みに失敗した場合にエラーを返す。
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[Sample], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", parent))?;
        }
    }

    let spec = hound::WavSpec {
        channels: 1, // モノラル固定
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("WAVファイルの作成に失敗: {:?}", path))?;

    for &sample in samples {
        writer
            .write_sample(to_i16(sample))
            .with_context(|| "WAVファイルへのサンプル書き込みに失敗")?;
    }

    writer
        .finalize()
        .with_context(|| "WAVファイルのファイナライズに失敗")?;

    log::debug!(
        "WAVファイル書き込み完了: {:?} ({} サンプル, {:.2}秒)",
        path,
        samples.len(),
        samples.len() as f64 / sample_rate as f64
    );

    Ok(())
}

/// サンプル列をメモリ上の WAV データに変換
///
/// HTTP 認識バックエンドへの送信用。フォーマットはファイル保存と同一。
///
/// # Errors
///
/// エンコードに失敗した場合にエラーを返す。
pub fn wav_bytes(samples: &[Sample], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).with_context(|| "WAVライター作成失敗")?;
        for &sample in samples {
            writer
                .write_sample(to_i16(sample))
                .with_context(|| "WAV書き込み失敗")?;
        }
        writer.finalize().with_context(|| "WAV finalize失敗")?;
    }

    Ok(cursor.into_inner())
}

/// WAV ファイルを読み込んで正規化サンプルに戻す
///
/// ヘッダサイズに満たないファイルは破損として拒否する。
///
/// # Errors
///
/// ファイルが存在しない、ヘッダより短い、またはパースに失敗した
/// 場合にエラーを返す。
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();

    let metadata =
        fs::metadata(path).with_context(|| format!("WAVファイルが読み込めません: {:?}", path))?;
    if metadata.len() < WAV_HEADER_SIZE {
        anyhow::bail!(
            "WAVファイルが破損しています（{} バイト < ヘッダ {} バイト）: {:?}",
            metadata.len(),
            WAV_HEADER_SIZE,
            path
        );
    }

    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("WAVファイルのオープンに失敗: {:?}", path))?;

    let samples: Vec<Sample> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / 32767.0))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("WAVサンプルの読み込みに失敗: {:?}", path))?;

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_wav_roundtrip_within_quantization_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("roundtrip.wav");

        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.01).sin() * 0.8).collect();

        write_wav(&path, &samples, 16000).unwrap();
        let restored = read_wav(&path).unwrap();

        assert_eq!(restored.len(), samples.len());
        for (original, read) in samples.iter().zip(restored.iter()) {
            // 16bit 量子化誤差以内
            assert!((original - read).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_out_of_range_samples_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clamp.wav");

        write_wav(&path, &[1.5, -1.5, 0.0], 16000).unwrap();
        let restored = read_wav(&path).unwrap();

        assert!((restored[0] - 1.0).abs() < 0.001);
        assert!((restored[1] + 1.0001).abs() < 0.01);
        assert_eq!(restored[2], 0.0);
    }

    #[test]
    fn test_short_file_rejected_as_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.wav");

        // ヘッダサイズ未満のゴミデータ
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"RIFF....").unwrap();
        drop(file);

        let result = read_wav(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("破損"));
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(read_wav("/nonexistent/utt.wav").is_err());
    }

    #[test]
    fn test_write_creates_output_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/utt.wav");

        write_wav(&path, &[0.0; 160], 16000).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_utterance_wav_path_format() {
        let path = utterance_wav_path("/tmp/utt");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("utt_"));
        assert!(name.ends_with(".wav"));
    }
}
