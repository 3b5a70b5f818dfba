use crate::config::RemoteConfig;
use crate::sidecar;
use crate::transcript::TranscriptStore;
use crate::types::EnrichmentTask;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use tokio::sync::mpsc;

/// リモート候補取得サービスのレスポンス
#[derive(Debug, Deserialize)]
struct CandidateResponse {
    sentence_candidates: Vec<String>,
}

/// 候補文の取得先の契約
///
/// 本番実装は HTTP サービス、テストではフェイクを差し込む。
#[async_trait]
pub trait CandidateFetcher: Send + Sync {
    /// 発話音声を送信して候補文のリストを取得する
    async fn fetch_candidates(
        &self,
        task: &EnrichmentTask,
        audio: Vec<u8>,
    ) -> Result<Vec<String>>;
}

/// HTTP 経由の候補取得サービスクライアント
///
/// multipart リクエストで `{user_id, filename, raw_audio_bytes, label,
/// candidate_count}` を送り、`{sentence_candidates}` を受け取る。
/// 認証などのトランスポート詳細はサービス側の責務。
pub struct HttpCandidateFetcher {
    config: RemoteConfig,
    client: reqwest::Client,
}

impl HttpCandidateFetcher {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("候補取得サービス HTTPクライアント作成失敗")?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl CandidateFetcher for HttpCandidateFetcher {
    async fn fetch_candidates(
        &self,
        task: &EnrichmentTask,
        audio: Vec<u8>,
    ) -> Result<Vec<String>> {
        let filename = std::path::Path::new(&task.wav_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("utterance.wav")
            .to_string();

        let part = multipart::Part::bytes(audio)
            .file_name(filename.clone())
            .mime_str("audio/wav")?;

        let form = multipart::Form::new()
            .text("user_id", self.config.user_id.clone())
            .text("filename", filename)
            .text("label", task.current_text.clone())
            .text("candidate_count", self.config.candidate_count.to_string())
            .part("raw_audio_bytes", part);

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .context("候補取得リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("候補取得サービス エラー: {} - {}", status, error_text);
        }

        let parsed: CandidateResponse = response
            .json()
            .await
            .context("候補取得レスポンスのパース失敗")?;

        Ok(parsed.sentence_candidates)
    }
}

/// エンリッチメントワーカー
///
/// 確定した発話のキュー（無制限・FIFO）を1つずつ消費し、
/// 候補文をサイドカーと TranscriptStore の両方にマージする。
/// キャプチャや処理タスクをブロックせず、独立して動作する。
///
/// - サイドカーに候補が既にあればリモート呼び出しなしで完了（冪等）
/// - マージ前にサイドカーを読み直し、並行するユーザ編集を壊さない
/// - 失敗したタスクはログを残して破棄する（リトライなし）
pub struct EnrichmentWorker {
    rx: mpsc::UnboundedReceiver<EnrichmentTask>,
    fetcher: Arc<dyn CandidateFetcher>,
    store: TranscriptStore,
}

impl EnrichmentWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<EnrichmentTask>,
        fetcher: Arc<dyn CandidateFetcher>,
        store: TranscriptStore,
    ) -> Self {
        Self { rx, fetcher, store }
    }

    /// キューが閉じられるまでタスクを消費し続ける
    pub async fn run(mut self) {
        log::info!("エンリッチメントワーカーを開始");
        while let Some(task) = self.rx.recv().await {
            log::debug!("エンリッチメントタスク受信: {}", task.wav_path);
            if let Err(e) = self.process(&task).await {
                // リトライせずに破棄する
                log::warn!("エンリッチメント失敗（破棄）: {}: {:#}", task.wav_path, e);
            }
        }
        log::info!("エンリッチメントワーカーを終了");
    }

    async fn process(&self, task: &EnrichmentTask) -> Result<()> {
        let record = sidecar::read_record(&task.wav_path)
            .with_context(|| "サイドカーの読み込みに失敗")?;

        // 冪等性: 候補が既にあればリモート呼び出しを省略
        if record.has_candidates() {
            log::debug!("候補取得をスキップ（既に候補あり）: {}", task.wav_path);
            return Ok(());
        }

        let audio = fs::read(&task.wav_path)
            .with_context(|| format!("発話音声の読み込みに失敗: {}", task.wav_path))?;

        let candidates = self.fetcher.fetch_candidates(task, audio).await?;
        if candidates.is_empty() {
            log::debug!("候補なし: {}", task.wav_path);
            return Ok(());
        }

        // 取得中に行われたユーザ編集を壊さないよう読み直してからマージ
        let mut record = sidecar::read_record(&task.wav_path)
            .with_context(|| "マージ前のサイドカー再読込に失敗")?;
        let mut merged = record.remote_candidates.take().unwrap_or_default();
        merged.extend(candidates.iter().cloned());
        record.remote_candidates = Some(merged);
        sidecar::write_record(&task.wav_path, &record)?;

        if !self.store.merge_candidates(&task.wav_path, &candidates) {
            anyhow::bail!("マージ対象のエントリが見つかりません: {}", task.wav_path);
        }

        log::info!(
            "候補 {} 件をマージ: {}",
            candidates.len(),
            task.wav_path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SidecarRecord;
    use crate::wav;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 呼び出し回数を数えるフェイク
    struct FakeFetcher {
        calls: AtomicUsize,
        candidates: Vec<String>,
        fail: bool,
    }

    impl FakeFetcher {
        fn returning(candidates: Vec<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                candidates: candidates.into_iter().map(String::from).collect(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                candidates: Vec::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl CandidateFetcher for FakeFetcher {
        async fn fetch_candidates(
            &self,
            _task: &EnrichmentTask,
            _audio: Vec<u8>,
        ) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("ネットワークエラー（テスト用）");
            }
            Ok(self.candidates.clone())
        }
    }

    fn task_for(wav_path: &str) -> EnrichmentTask {
        EnrichmentTask {
            wav_path: wav_path.to_string(),
            user_id: "user-01".to_string(),
            original_text: "もとの文".to_string(),
            current_text: "もとの文".to_string(),
        }
    }

    /// WAV + サイドカーのペアを作る
    fn write_pair(dir: &TempDir, candidates: Option<Vec<String>>) -> String {
        let wav_path = dir.path().join("utt_test.wav");
        wav::write_wav(&wav_path, &[0.1; 160], 16000).unwrap();
        let record = SidecarRecord {
            original: "もとの文".to_string(),
            modified: "もとの文".to_string(),
            checked: false,
            mutable: true,
            remote_candidates: candidates,
        };
        sidecar::write_record(&wav_path, &record).unwrap();
        wav_path.to_str().unwrap().to_string()
    }

    async fn run_worker(
        fetcher: Arc<dyn CandidateFetcher>,
        store: TranscriptStore,
        tasks: Vec<EnrichmentTask>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        for task in tasks {
            tx.send(task).unwrap();
        }
        drop(tx); // キューを閉じてワーカーを終了させる
        EnrichmentWorker::new(rx, fetcher, store).run().await;
    }

    #[tokio::test]
    async fn test_candidates_merged_into_sidecar_and_store() {
        let dir = TempDir::new().unwrap();
        let wav_path = write_pair(&dir, None);

        let store = TranscriptStore::new();
        store.finalize_entry("もとの文", &wav_path);

        let fetcher = Arc::new(FakeFetcher::returning(vec!["候補A", "候補B"]));
        run_worker(fetcher.clone(), store.clone(), vec![task_for(&wav_path)]).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let record = sidecar::read_record(&wav_path).unwrap();
        assert_eq!(
            record.remote_candidates,
            Some(vec!["候補A".to_string(), "候補B".to_string()])
        );

        let entries = store.entries();
        assert_eq!(
            entries[0].remote_candidates,
            vec!["候補A".to_string(), "候補B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_idempotent_skip_when_sidecar_has_candidates() {
        let dir = TempDir::new().unwrap();
        let wav_path = write_pair(&dir, Some(vec!["既存の候補".to_string()]));

        let store = TranscriptStore::new();
        store.finalize_entry("もとの文", &wav_path);

        let fetcher = Arc::new(FakeFetcher::returning(vec!["新しい候補"]));
        // 2回処理してもネットワーク呼び出しはゼロ
        run_worker(
            fetcher.clone(),
            store.clone(),
            vec![task_for(&wav_path), task_for(&wav_path)],
        )
        .await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        let record = sidecar::read_record(&wav_path).unwrap();
        assert_eq!(record.remote_candidates, Some(vec!["既存の候補".to_string()]));
    }

    #[tokio::test]
    async fn test_fetch_failure_drops_task_without_retry() {
        let dir = TempDir::new().unwrap();
        let wav_path = write_pair(&dir, None);

        let store = TranscriptStore::new();
        store.finalize_entry("もとの文", &wav_path);

        let fetcher = Arc::new(FakeFetcher::failing());
        run_worker(fetcher.clone(), store.clone(), vec![task_for(&wav_path)]).await;

        // 1回だけ試行され、リトライされない
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // エントリの候補は空のまま、サイドカーも変更なし
        assert!(store.entries()[0].remote_candidates.is_empty());
        let record = sidecar::read_record(&wav_path).unwrap();
        assert!(record.remote_candidates.is_none());
    }

    #[tokio::test]
    async fn test_missing_sidecar_drops_task() {
        let dir = TempDir::new().unwrap();
        let wav_path = dir.path().join("orphan.wav");
        wav::write_wav(&wav_path, &[0.1; 160], 16000).unwrap();

        let store = TranscriptStore::new();
        let fetcher = Arc::new(FakeFetcher::returning(vec!["候補"]));
        run_worker(
            fetcher.clone(),
            store,
            vec![task_for(wav_path.to_str().unwrap())],
        )
        .await;

        // サイドカーが読めない時点で破棄され、ネットワークには出ない
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_merge_preserves_user_edits_in_sidecar() {
        let dir = TempDir::new().unwrap();
        let wav_path = write_pair(&dir, None);

        // ユーザが既に修正・確認済みのサイドカー
        let mut record = sidecar::read_record(&wav_path).unwrap();
        record.modified = "ユーザが直した文".to_string();
        record.checked = true;
        sidecar::write_record(&wav_path, &record).unwrap();

        let store = TranscriptStore::new();
        store.finalize_entry("もとの文", &wav_path);

        let fetcher = Arc::new(FakeFetcher::returning(vec!["候補A"]));
        run_worker(fetcher, store, vec![task_for(&wav_path)]).await;

        let merged = sidecar::read_record(&wav_path).unwrap();
        assert_eq!(merged.modified, "ユーザが直した文");
        assert!(merged.checked);
        assert_eq!(merged.remote_candidates, Some(vec!["候補A".to_string()]));
    }
}
