use crate::config::Config;
use crate::endpointer::Endpointer;
use crate::recognizer::{decode_utterance, Recognizer};
use crate::sidecar;
use crate::transcript::TranscriptStore;
use crate::types::{
    EnrichmentTask, FinalizedUtterance, FrameBlock, Sample, SidecarRecord, TranscriptEntry,
};
use crate::wav;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// 音声処理パイプライン（処理タスク本体）
///
/// キャプチャタスクから受信したフレームを Endpointer に供給し、
/// 部分認識の周期実行・無音タイムアウトによる発話確定・
/// 確定発話の保存とエンリッチメントキューへの投入を行う。
///
/// フレーム受信・フラッシュ要求・タイマーを `select!` で待ち合わせ、
/// ポーリングは行わない。Endpointer はこのタスクが専有する。
pub struct Pipeline {
    endpointer: Endpointer,
    recognizer: Arc<dyn Recognizer>,
    store: TranscriptStore,

    /// エンリッチメントキュー（None なら投入しない）
    enrichment_tx: Option<mpsc::UnboundedSender<EnrichmentTask>>,

    user_id: String,
    sample_rate: u32,
    utterance_dir: PathBuf,

    /// 部分認識の周期
    partial_interval: Duration,

    /// 最後に部分認識を開始した時刻（成否に関わらず更新）
    last_partial_at: Instant,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        endpointer: Endpointer,
        recognizer: Arc<dyn Recognizer>,
        store: TranscriptStore,
        enrichment_tx: Option<mpsc::UnboundedSender<EnrichmentTask>>,
    ) -> Self {
        let user_id = config
            .remote
            .as_ref()
            .map(|r| r.user_id.clone())
            .unwrap_or_default();

        Self {
            endpointer,
            recognizer,
            store,
            enrichment_tx,
            user_id,
            sample_rate: config.audio.sample_rate,
            utterance_dir: PathBuf::from(&config.output.utterance_dir),
            partial_interval: Duration::from_millis(config.endpoint.partial_interval_ms),
            last_partial_at: Instant::now(),
        }
    }

    /// フレームチャネルが閉じられるまで処理を続ける
    ///
    /// 終了時は残りのフレームを取り込んだうえでフラッシュし、
    /// 蓄積済みの発話を確定してから戻る。
    pub async fn run(
        mut self,
        mut frame_rx: mpsc::Receiver<FrameBlock>,
        mut flush_rx: watch::Receiver<u64>,
    ) {
        log::info!("処理タスクを開始");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                frame = frame_rx.recv() => match frame {
                    Some(block) => self.process_frame(block).await,
                    // キャプチャ終了
                    None => break,
                },
                result = flush_rx.changed() => {
                    if result.is_err() {
                        break;
                    }
                    log::debug!("フラッシュ要求を受信");
                    self.drain_frames(&mut frame_rx);
                    self.handle_flush().await;
                }
                _ = async {
                    if let Some(at) = deadline {
                        tokio::time::sleep_until(at).await;
                    }
                }, if deadline.is_some() => {
                    self.tick().await;
                }
            }
        }

        // 停止時: 取り込み済みの発話を破棄しない
        self.handle_flush().await;
        log::info!("処理タスクを終了");
    }

    /// 次にタイマーで起きるべき時刻
    ///
    /// 部分認識の次回実行時刻と無音タイムアウトの評価時刻のうち
    /// 早いほう。どちらも不要なら None。
    fn next_deadline(&self) -> Option<Instant> {
        let partial = if self.endpointer.speech_in_progress() {
            Some(self.last_partial_at + self.partial_interval)
        } else {
            None
        };
        let linger = self.endpointer.linger_deadline();

        match (partial, linger) {
            (Some(p), Some(l)) => Some(p.min(l)),
            (Some(p), None) => Some(p),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        }
    }

    async fn process_frame(&mut self, block: FrameBlock) {
        self.endpointer.push_frames(&block.samples, Instant::now());
        self.tick().await;
    }

    /// タイムアウト評価と部分認識の実行
    async fn tick(&mut self) {
        let now = Instant::now();
        if let Some(utterance) = self.endpointer.poll_endpoint(now) {
            self.finalize_utterance(utterance).await;
            return;
        }
        self.maybe_partial(now).await;
    }

    /// 周期が来ていれば累積音声の部分認識を行う
    ///
    /// 認識中もフレーム受信は継続するため、1サイクルの所要時間が
    /// 周期を超えても取りこぼしは起きない（次の周期が遅れるだけ）。
    async fn maybe_partial(&mut self, now: Instant) {
        if !self.endpointer.speech_in_progress() {
            return;
        }
        if now.duration_since(self.last_partial_at) < self.partial_interval {
            return;
        }

        let samples = self.endpointer.consumed().to_vec();
        // 成否に関わらず周期をリセットする
        self.last_partial_at = now;
        if samples.is_empty() {
            return;
        }

        match decode_utterance(self.recognizer.as_ref(), &samples, self.sample_rate).await {
            Ok(text) => {
                log::debug!("部分認識結果: {:?} ({} サンプル)", text, samples.len());
                self.store.provisional_update(&text);
            }
            Err(e) => {
                // このサイクルの結果だけが失われる
                log::warn!("部分認識失敗: {:#}", e);
            }
        }
    }

    /// 明示的フラッシュ（linger を待たずに確定）
    async fn handle_flush(&mut self) {
        if let Some(utterance) = self.endpointer.flush() {
            self.finalize_utterance(utterance).await;
        }
    }

    /// 確定した発話の最終認識・保存・エンリッチメント投入
    async fn finalize_utterance(&mut self, utterance: FinalizedUtterance) {
        let raw = match decode_utterance(
            self.recognizer.as_ref(),
            &utterance.recognition_samples,
            self.sample_rate,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                log::warn!("最終認識失敗: {:#}", e);
                String::new()
            }
        };
        let text = self.store.resolve_final_text(&raw);

        let wav_path = match self.persist(&utterance.persist_samples, &text) {
            Ok(path) => path,
            Err(e) => {
                // 保存失敗でもテキストは確定させる
                log::error!("発話の保存に失敗: {:#}", e);
                String::new()
            }
        };

        match self.store.finalize_entry(&text, &wav_path) {
            Some(entry) if !wav_path.is_empty() => {
                self.enqueue_enrichment(&entry);
            }
            Some(_) => {
                // 未保存の発話はエンリッチメント対象外
                log::warn!("未保存のためエンリッチメントをスキップ: {:?}", text);
            }
            None => {
                log::debug!("空の確定結果を破棄");
            }
        }

        // 次の発話の部分認識周期を仕切り直す
        self.last_partial_at = Instant::now();
    }

    fn persist(&self, samples: &[Sample], text: &str) -> Result<String> {
        let path = wav::utterance_wav_path(&self.utterance_dir);
        self.persist_pair(&path, samples, text)
    }

    /// WAV とサイドカーをペアで保存する
    ///
    /// 片方だけが残る状態を作らない。サイドカーが書けなければ
    /// WAV を取り下げ、発話全体を未保存として扱う。
    fn persist_pair(&self, path: &Path, samples: &[Sample], text: &str) -> Result<String> {
        wav::write_wav(path, samples, self.sample_rate)?;
        let wav_path = path.to_string_lossy().into_owned();

        if let Err(e) = sidecar::write_record(&wav_path, &SidecarRecord::new(text)) {
            if let Err(remove_err) = std::fs::remove_file(path) {
                log::warn!("WAV の取り下げに失敗: {:?}: {:#}", path, remove_err);
            }
            return Err(e);
        }

        log::info!("発話を保存: {:?} ({} サンプル)", path, samples.len());
        Ok(wav_path)
    }

    fn enqueue_enrichment(&self, entry: &TranscriptEntry) {
        if let Some(tx) = &self.enrichment_tx {
            let task = EnrichmentTask {
                wav_path: entry.wav_path.clone(),
                user_id: self.user_id.clone(),
                original_text: entry.recognized_text.clone(),
                current_text: entry.modified_text.clone(),
            };
            if tx.send(task).is_err() {
                log::warn!("エンリッチメントキューが閉じています");
            }
        }
    }

    /// チャネルに残っているフレームを同期的に取り込む
    fn drain_frames(&mut self, frame_rx: &mut mpsc::Receiver<FrameBlock>) {
        let now = Instant::now();
        while let Ok(block) = frame_rx.try_recv() {
            self.endpointer.push_frames(&block.samples, now);
        }
    }
}
