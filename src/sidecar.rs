use crate::types::SidecarRecord;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// WAV パスから対になるサイドカーのパスを導出
///
/// 同じベース名で拡張子だけ `.jsonl` に変わる。
pub fn sidecar_path<P: AsRef<Path>>(wav_path: P) -> PathBuf {
    wav_path.as_ref().with_extension("jsonl")
}

/// サイドカーレコードを書き込む
///
/// JSON 1件を1行として保存する。既存の内容は上書きされる。
///
/// # Errors
///
/// シリアライズまたは書き込みに失敗した場合にエラーを返す。
pub fn write_record<P: AsRef<Path>>(wav_path: P, record: &SidecarRecord) -> Result<()> {
    let path = sidecar_path(&wav_path);
    let mut json =
        serde_json::to_string(record).with_context(|| "サイドカーのシリアライズに失敗")?;
    json.push('\n');
    fs::write(&path, json)
        .with_context(|| format!("サイドカーの書き込みに失敗: {:?}", path))?;
    Ok(())
}

/// サイドカーレコードを読み込む
///
/// # Errors
///
/// ファイルが存在しない、空である、またはパースに失敗した場合に
/// エラーを返す。
pub fn read_record<P: AsRef<Path>>(wav_path: P) -> Result<SidecarRecord> {
    let path = sidecar_path(&wav_path);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("サイドカーの読み込みに失敗: {:?}", path))?;

    let line = content
        .lines()
        .find(|l| !l.trim().is_empty())
        .with_context(|| format!("サイドカーが空です: {:?}", path))?;

    let record: SidecarRecord = serde_json::from_str(line)
        .with_context(|| format!("サイドカーのパースに失敗: {:?}", path))?;
    Ok(record)
}

/// ディレクトリ走査の結果
///
/// WAV とサイドカーはペアで作成されるため、片方だけが存在するのは
/// データ整合性違反。呼び出し側は orphan を警告として表面化する。
#[derive(Debug, Default)]
pub struct PairScan {
    /// 両方そろっている WAV パス（ファイル名順）
    pub pairs: Vec<PathBuf>,

    /// サイドカーの無い WAV
    pub orphan_wavs: Vec<PathBuf>,

    /// WAV の無いサイドカー
    pub orphan_sidecars: Vec<PathBuf>,
}

impl PairScan {
    /// 整合性違反があるかどうか
    pub fn has_orphans(&self) -> bool {
        !self.orphan_wavs.is_empty() || !self.orphan_sidecars.is_empty()
    }
}

/// 発話ディレクトリを走査して WAV/サイドカーのペアを検証する
///
/// # Errors
///
/// ディレクトリの読み取りに失敗した場合にエラーを返す。
/// orphan は結果に含めて返し、ここでは握りつぶさない。
pub fn scan_pairs<P: AsRef<Path>>(dir: P) -> Result<PairScan> {
    let dir = dir.as_ref();
    let mut wav_stems: BTreeSet<PathBuf> = BTreeSet::new();
    let mut sidecar_stems: BTreeSet<PathBuf> = BTreeSet::new();

    for entry in
        fs::read_dir(dir).with_context(|| format!("ディレクトリの読み取りに失敗: {:?}", dir))?
    {
        let path = entry?.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("wav") => {
                wav_stems.insert(path.with_extension(""));
            }
            Some("jsonl") => {
                sidecar_stems.insert(path.with_extension(""));
            }
            _ => {}
        }
    }

    let mut scan = PairScan::default();
    for stem in &wav_stems {
        if sidecar_stems.contains(stem) {
            scan.pairs.push(stem.with_extension("wav"));
        } else {
            scan.orphan_wavs.push(stem.with_extension("wav"));
        }
    }
    for stem in &sidecar_stems {
        if !wav_stems.contains(stem) {
            scan.orphan_sidecars.push(stem.with_extension("jsonl"));
        }
    }

    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SidecarRecord {
        SidecarRecord {
            original: "もとの認識結果".to_string(),
            modified: "修正済みテキスト".to_string(),
            checked: true,
            mutable: false,
            remote_candidates: Some(vec!["候補1".to_string(), "候補2".to_string()]),
        }
    }

    #[test]
    fn test_sidecar_path_shares_basename() {
        let path = sidecar_path("/tmp/utt/utt_20250101_120000_000.wav");
        assert_eq!(
            path,
            PathBuf::from("/tmp/utt/utt_20250101_120000_000.jsonl")
        );
    }

    #[test]
    fn test_record_roundtrip_exact() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let wav = temp_dir.path().join("utt_001.wav");

        let record = sample_record();
        write_record(&wav, &record).unwrap();
        let restored = read_record(&wav).unwrap();

        assert_eq!(restored, record);
    }

    #[test]
    fn test_roundtrip_without_candidates() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let wav = temp_dir.path().join("utt_002.wav");

        let record = SidecarRecord {
            original: "テスト".to_string(),
            modified: "テスト".to_string(),
            checked: false,
            mutable: true,
            remote_candidates: None,
        };
        write_record(&wav, &record).unwrap();
        let restored = read_record(&wav).unwrap();

        assert_eq!(restored, record);
        assert!(!restored.has_candidates());
    }

    #[test]
    fn test_read_missing_sidecar_is_error() {
        assert!(read_record("/nonexistent/utt.wav").is_err());
    }

    #[test]
    fn test_read_empty_sidecar_is_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let wav = temp_dir.path().join("utt_003.wav");
        fs::write(sidecar_path(&wav), "\n").unwrap();

        assert!(read_record(&wav).is_err());
    }

    #[test]
    fn test_scan_detects_orphans() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();

        // そろったペア
        fs::write(dir.join("utt_a.wav"), b"dummy").unwrap();
        fs::write(dir.join("utt_a.jsonl"), b"{}").unwrap();
        // WAV のみ
        fs::write(dir.join("utt_b.wav"), b"dummy").unwrap();
        // サイドカーのみ
        fs::write(dir.join("utt_c.jsonl"), b"{}").unwrap();
        // 無関係なファイル
        fs::write(dir.join("notes.txt"), b"memo").unwrap();

        let scan = scan_pairs(dir).unwrap();
        assert_eq!(scan.pairs, vec![dir.join("utt_a.wav")]);
        assert_eq!(scan.orphan_wavs, vec![dir.join("utt_b.wav")]);
        assert_eq!(scan.orphan_sidecars, vec![dir.join("utt_c.jsonl")]);
        assert!(scan.has_orphans());
    }

    #[test]
    fn test_scan_clean_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let scan = scan_pairs(temp_dir.path()).unwrap();
        assert!(scan.pairs.is_empty());
        assert!(!scan.has_orphans());
    }
}
