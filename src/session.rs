use crate::audio_input::FrameSource;
use crate::config::Config;
use crate::endpointer::Endpointer;
use crate::enrichment::{EnrichmentWorker, HttpCandidateFetcher};
use crate::pipeline::Pipeline;
use crate::recognizer::Recognizer;
use crate::sidecar;
use crate::transcript::TranscriptStore;
use crate::types::FrameBlock;
use crate::vad::EnergyVad;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// フレームチャネルの容量
///
/// キャプチャタスクは blocking_send で送るため、処理が一時的に
/// 追いついていなくてもフレームを落とさない程度の余裕を持たせる。
const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// 録音セッション
///
/// フレーム供給元・キャプチャタスク・処理タスク・エンリッチメント
/// ワーカーを束ね、停止時に順序立てて畳む。
///
/// ```text
/// [FrameSource] → キャプチャタスク → mpsc → [Pipeline (処理タスク)] → TranscriptStore
///                                                  │                      ↑
///                                                  └→ mpsc → [EnrichmentWorker]
/// ```
///
/// キャプチャタスクは供給元への read ループを回す唯一の書き手で、
/// 停止フラグを確認しながらフレームを処理タスクへ転送する。停止時は
/// フラグを下ろしてタスクを抜けさせ、フレームチャネルが閉じると処理
/// タスクが残りをフラッシュして終了し、それに伴いエンリッチメント
/// キューも閉じてワーカーが残タスクを処理しきって終了する。
pub struct CaptureSession {
    running: Arc<AtomicBool>,
    store: TranscriptStore,
    flush_tx: watch::Sender<u64>,
    capture_handle: JoinHandle<()>,
    pipeline_handle: JoinHandle<()>,
    enrichment_handle: Option<JoinHandle<()>>,
}

impl CaptureSession {
    /// セッションを構築して開始する
    pub fn start(
        config: &Config,
        mut source: Box<dyn FrameSource>,
        recognizer: Arc<dyn Recognizer>,
    ) -> Result<Self> {
        warn_orphans(&config.output.utterance_dir);

        let store = TranscriptStore::new();

        // エンリッチメントワーカー（remote 設定がある場合のみ）
        let (enrichment_tx, enrichment_handle) = match &config.remote {
            Some(remote) if remote.enabled => {
                let fetcher = HttpCandidateFetcher::new(remote.clone())
                    .context("候補取得クライアントの初期化に失敗")?;
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = EnrichmentWorker::new(rx, Arc::new(fetcher), store.clone());
                (Some(tx), Some(tokio::spawn(worker.run())))
            }
            Some(_) => {
                log::info!("エンリッチメントは無効化されています");
                (None, None)
            }
            None => {
                log::info!("remote 設定なし: エンリッチメントをスキップします");
                (None, None)
            }
        };

        // 処理タスク
        let endpointer = Endpointer::new(
            Box::new(EnergyVad::new(&config.vad, config.audio.sample_rate)),
            &config.endpoint,
            config.audio.sample_rate,
        );
        let pipeline = Pipeline::new(config, endpointer, recognizer, store.clone(), enrichment_tx);

        let (frame_tx, frame_rx) = mpsc::channel::<FrameBlock>(FRAME_CHANNEL_CAPACITY);
        let (flush_tx, flush_rx) = watch::channel(0u64);
        let pipeline_handle = tokio::spawn(pipeline.run(frame_rx, flush_rx));

        source.start().context("キャプチャの開始に失敗")?;

        // キャプチャタスク: 供給元への read ループを回す唯一の書き手。
        // 空のフレームは一時的な空読みなのでスキップしてループを続ける。
        let running = Arc::new(AtomicBool::new(true));
        let running_capture = running.clone();
        let capture_handle = tokio::task::spawn_blocking(move || {
            log::info!("キャプチャタスクを開始しました");
            while running_capture.load(Ordering::SeqCst) {
                match source.read() {
                    Some(block) => {
                        if block.samples.is_empty() {
                            continue;
                        }
                        if frame_tx.blocking_send(block).is_err() {
                            log::warn!("フレームチャネルが閉じています");
                            break;
                        }
                    }
                    None => {
                        log::info!("フレーム供給元が終端に達しました");
                        break;
                    }
                }
            }
            source.stop();
            log::info!("キャプチャタスクを終了しました");
            // frame_tx がここで落ち、処理タスクが畳まれる
        });

        log::info!("録音セッションを開始しました");

        Ok(Self {
            running,
            store,
            flush_tx,
            capture_handle,
            pipeline_handle,
            enrichment_handle,
        })
    }

    /// 蓄積中の発話を即時確定する
    ///
    /// linger タイムアウトを待たずに現時点のセグメントで発話を閉じる。
    /// 要求は単一スロットで合流され、最新の1回だけが処理される。
    pub fn request_flush(&self) {
        self.flush_tx.send_modify(|n| *n += 1);
    }

    /// 転記ストアのハンドル
    pub fn store(&self) -> TranscriptStore {
        self.store.clone()
    }

    /// セッションを停止し、全タスクの完了を待つ
    ///
    /// 停止フラグを下ろしてキャプチャタスクを終了させると、フレーム
    /// チャネルが閉じて処理タスクが残りをフラッシュして終了する。
    /// 続いてエンリッチメントキューが閉じ、ワーカーは残タスクを
    /// 処理しきってから終了する。
    pub async fn stop(self) -> Result<TranscriptStore> {
        log::info!("停止処理を開始します...");

        self.running.store(false, Ordering::SeqCst);

        self.capture_handle
            .await
            .context("キャプチャタスクの終了待ちに失敗")?;

        self.pipeline_handle
            .await
            .context("処理タスクの終了待ちに失敗")?;

        if let Some(handle) = self.enrichment_handle {
            handle
                .await
                .context("エンリッチメントワーカーの終了待ちに失敗")?;
        }

        log::info!("録音セッションを終了しました");
        Ok(self.store)
    }
}

/// 起動時に発話ディレクトリの WAV/サイドカー対応を検査する
///
/// orphan は警告に留める。ディレクトリが無ければ何もしない。
fn warn_orphans(utterance_dir: &str) {
    if !Path::new(utterance_dir).is_dir() {
        return;
    }
    match sidecar::scan_pairs(utterance_dir) {
        Ok(scan) => {
            if scan.has_orphans() {
                log::warn!(
                    "発話ディレクトリに不整合があります: サイドカー欠落 {} 件, WAV 欠落 {} 件",
                    scan.orphan_wavs.len(),
                    scan.orphan_sidecars.len()
                );
                for path in &scan.orphan_wavs {
                    log::warn!("サイドカーがありません: {:?}", path);
                }
                for path in &scan.orphan_sidecars {
                    log::warn!("WAV がありません: {:?}", path);
                }
            } else {
                log::info!("発話ディレクトリ検査 OK: {} ペア", scan.pairs.len());
            }
        }
        Err(e) => {
            log::warn!("発話ディレクトリの検査に失敗: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::fake::FakeRecognizer;
    use crate::types::Sample;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::TempDir;

    /// スクリプト済みフレームを流すフェイク供給元
    ///
    /// hold_open を立てるとスクリプト消費後も空読みを返し続け、
    /// 停止フラグで畳まれるまでストリームを開いたままにする。
    struct ScriptedSource {
        frames: VecDeque<Vec<Sample>>,
        hold_open: bool,
        /// スクリプトを送り切ったら立つ
        drained: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Vec<Sample>>) -> Self {
            Self {
                frames: frames.into(),
                hold_open: false,
                drained: Arc::new(AtomicBool::new(false)),
            }
        }

        fn holding_open(frames: Vec<Vec<Sample>>) -> Self {
            let mut source = Self::new(frames);
            source.hold_open = true;
            source
        }
    }

    impl FrameSource for ScriptedSource {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn read(&mut self) -> Option<FrameBlock> {
            match self.frames.pop_front() {
                Some(samples) => Some(FrameBlock { samples }),
                None if self.hold_open => {
                    self.drained.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                    Some(FrameBlock {
                        samples: Vec::new(),
                    })
                }
                None => {
                    self.drained.store(true, Ordering::SeqCst);
                    None
                }
            }
        }

        fn stop(&mut self) {}
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.output.utterance_dir = dir.path().to_string_lossy().into_owned();
        config
    }

    /// 発話1つ分のフレーム列（音声 → ハングオーバーを超える無音）
    fn speech_then_silence() -> Vec<Vec<Sample>> {
        let mut frames = Vec::new();
        for _ in 0..16 {
            frames.push(vec![0.5; 512]); // 約 -6dB、閾値 -40dB を超える
        }
        for _ in 0..16 {
            frames.push(vec![0.0; 512]);
        }
        frames
    }

    /// ストアにエントリが現れるまで待つ（上限あり）
    async fn wait_for_entries(store: &TranscriptStore, n: usize) {
        for _ in 0..500 {
            if store.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_session_finalizes_when_source_ends() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let recognizer = Arc::new(FakeRecognizer::new(vec!["セッションの発話"]));

        let session = CaptureSession::start(
            &config,
            Box::new(ScriptedSource::new(speech_then_silence())),
            recognizer,
        )
        .unwrap();

        // スクリプトが尽きるとチャネルが閉じ、フラッシュで確定する
        wait_for_entries(&session.store(), 1).await;
        let store = session.stop().await.unwrap();

        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recognized_text, "セッションの発話");
        assert!(std::path::Path::new(&entries[0].wav_path).exists());
    }

    #[tokio::test]
    async fn test_request_flush_finalizes_mid_session() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        // linger では確定しないようにしてフラッシュの効果だけを見る
        config.endpoint.linger_ms = 60_000;
        let recognizer = Arc::new(FakeRecognizer::new(vec!["フラッシュされた発話"]));

        let source = ScriptedSource::holding_open(speech_then_silence());
        let drained = source.drained.clone();
        let session = CaptureSession::start(&config, Box::new(source), recognizer).unwrap();

        // 全フレームが処理タスクへ渡ってからフラッシュする
        while !drained.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.request_flush();
        wait_for_entries(&session.store(), 1).await;

        let store = session.store();
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].recognized_text, "フラッシュされた発話");

        let store = session.stop().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_session_without_speech_produces_no_entries() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let recognizer = Arc::new(FakeRecognizer::new(vec![]));

        let frames = vec![vec![0.0; 512]; 8];
        let source = ScriptedSource::new(frames);
        let drained = source.drained.clone();
        let session =
            CaptureSession::start(&config, Box::new(source), recognizer.clone()).unwrap();

        while !drained.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let store = session.stop().await.unwrap();

        assert!(store.is_empty());
        assert_eq!(recognizer.decode_count(), 0);
    }
}
