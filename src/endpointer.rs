use crate::buffer::FrameBuffer;
use crate::config::EndpointConfig;
use crate::types::{EndpointState, FinalizedUtterance, Sample, SpeechSegment, VAD_WINDOW_SIZE};
use crate::vad::Vad;
use std::time::Duration;
use tokio::time::Instant;

/// 発話の組み立てと終端判定
///
/// フレームバッファと VAD を所有し、固定サイズのウィンドウを
/// 一度ずつ VAD に供給しながら SpeechSegment を到着順に蓄積する。
/// 最後のセグメント到着から linger 時間の無音が続くか、明示的な
/// フラッシュを受けた時点で発話を確定する。
///
/// 状態遷移: `Idle → SpeechActive → Lingering → (確定) → Idle`
///
/// この構造体は処理タスクだけが触れる。他タスクとの共有はしない。
pub struct Endpointer {
    vad: Box<dyn Vad>,
    buffer: FrameBuffer,

    /// 発話終端とみなす無音時間
    linger: Duration,

    /// full-window 保存時の前後パディング（サンプル数）
    preroll_samples: usize,

    /// true なら VAD セグメント連結のみを保存する
    save_vad_segments_only: bool,

    /// 到着順の音声セグメント
    segments: Vec<SpeechSegment>,

    /// 音声開始位置（full-window 保存の切り出し起点）
    speech_start_offset: Option<usize>,

    /// 最後のセグメントを取り出した時点の消費オフセット
    ///
    /// VAD はサンプル位置を報告しないため、ドレイン時点の
    /// 消費済み位置を音声終端の近似として使う
    last_segment_end_offset: usize,

    /// 最後のセグメント到着時刻
    last_segment_at: Option<Instant>,
}

impl Endpointer {
    pub fn new(vad: Box<dyn Vad>, config: &EndpointConfig, sample_rate: u32) -> Self {
        Self {
            vad,
            buffer: FrameBuffer::new(),
            linger: Duration::from_millis(config.linger_ms),
            preroll_samples: config.preroll_samples(sample_rate),
            save_vad_segments_only: config.save_vad_segments_only,
            segments: Vec::new(),
            speech_start_offset: None,
            last_segment_end_offset: 0,
            last_segment_at: None,
        }
    }

    /// キャプチャされたフレームを取り込み、ウィンドウ処理を進める
    pub fn push_frames(&mut self, samples: &[Sample], now: Instant) {
        self.buffer.append(samples);
        self.drive_windows(now);
    }

    /// 未消費バッファをフルウィンドウ単位で VAD に供給する
    ///
    /// 各ウィンドウは一度だけ渡され、処理後に出力待ちセグメントを
    /// すべてドレインする。
    fn drive_windows(&mut self, now: Instant) {
        while self.buffer.has_full_window(VAD_WINDOW_SIZE) {
            if let Some(window) = self.buffer.take_window(VAD_WINDOW_SIZE) {
                self.vad.accept_waveform(window);
            }

            let consumed = self.buffer.consumed_offset();

            // 音声開始の検出: プリロール分さかのぼった位置を記録
            if self.vad.is_speech_detected() && self.speech_start_offset.is_none() {
                let start = consumed.saturating_sub(VAD_WINDOW_SIZE + self.preroll_samples);
                log::debug!("音声開始: オフセット {} (消費位置 {})", start, consumed);
                self.speech_start_offset = Some(start);
            }

            // 出力待ちセグメントをドレイン
            while self.vad.has_queued_segment() {
                if let Some(segment) = self.vad.pop_segment() {
                    log::debug!(
                        "セグメント到着: {} サンプル (累計 {} 個)",
                        segment.len(),
                        self.segments.len() + 1
                    );
                    self.segments.push(segment);
                    self.last_segment_at = Some(now);
                    self.last_segment_end_offset = consumed;
                }
            }
        }
    }

    /// 現在の観測状態
    pub fn state(&self, now: Instant) -> EndpointState {
        if self.vad.is_speech_detected() {
            EndpointState::SpeechActive
        } else if self.segments.is_empty() {
            EndpointState::Idle
        } else {
            EndpointState::Lingering {
                progress: self.linger_progress(now).unwrap_or(1.0),
            }
        }
    }

    /// 無音カウントダウンの進捗 (`経過 / linger`、0.0〜1.0)
    ///
    /// セグメント未蓄積の場合は None。
    pub fn linger_progress(&self, now: Instant) -> Option<f32> {
        if self.segments.is_empty() {
            return None;
        }
        let last = self.last_segment_at?;
        let elapsed = now.duration_since(last);
        Some((elapsed.as_secs_f32() / self.linger.as_secs_f32()).clamp(0.0, 1.0))
    }

    /// 発話が進行中かどうか（部分認識の対象になる状態）
    pub fn speech_in_progress(&self) -> bool {
        self.vad.is_speech_detected() || !self.segments.is_empty()
    }

    /// 無音タイムアウトによる発話確定を判定する
    ///
    /// 蓄積済みセグメントがあり、VAD が音声を報告しておらず、
    /// 最後のセグメント到着から linger 時間が経過していれば確定する。
    pub fn poll_endpoint(&mut self, now: Instant) -> Option<FinalizedUtterance> {
        if self.segments.is_empty() || self.vad.is_speech_detected() {
            return None;
        }
        let last = self.last_segment_at?;
        if now.duration_since(last) >= self.linger {
            Some(self.finalize())
        } else {
            None
        }
    }

    /// 明示的なフラッシュ（停止時）
    ///
    /// セグメントがあれば linger を待たずに即時確定する。
    /// セグメントが空なら何も確定せず、未消費のバッファ末尾は破棄される。
    pub fn flush(&mut self) -> Option<FinalizedUtterance> {
        if self.segments.is_empty() {
            log::debug!("フラッシュ: セグメントなし、未消費バッファを破棄");
            self.discard();
            None
        } else {
            log::info!("フラッシュ: {} セグメントを即時確定", self.segments.len());
            Some(self.finalize())
        }
    }

    /// 次のタイムアウト評価時刻（処理ループのタイマー用）
    pub fn linger_deadline(&self) -> Option<Instant> {
        if self.segments.is_empty() || self.vad.is_speech_detected() {
            return None;
        }
        self.last_segment_at.map(|t| t + self.linger)
    }

    /// セグメントを到着順に連結し、保存音声を計算して状態を初期化する
    fn finalize(&mut self) -> FinalizedUtterance {
        let recognition_samples: Vec<Sample> = self
            .segments
            .iter()
            .flat_map(|s| s.samples.iter().copied())
            .collect();

        let persist_samples = if self.save_vad_segments_only {
            recognition_samples.clone()
        } else {
            let start = self.speech_start_offset.unwrap_or(0);
            let end = self.last_segment_end_offset + self.preroll_samples;
            self.buffer.slice(start, end).to_vec()
        };

        log::info!(
            "発話確定: セグメント {} 個, 認識用 {} サンプル, 保存用 {} サンプル",
            self.segments.len(),
            recognition_samples.len(),
            persist_samples.len()
        );

        self.discard();

        FinalizedUtterance {
            recognition_samples,
            persist_samples,
        }
    }

    /// 発話状態をすべて初期化する
    fn discard(&mut self) {
        self.buffer.reset();
        self.vad.reset();
        self.segments.clear();
        self.speech_start_offset = None;
        self.last_segment_end_offset = 0;
        self.last_segment_at = None;
    }

    /// 先頭から消費済み位置までの累積サンプル（部分認識用）
    pub fn consumed(&self) -> &[Sample] {
        self.buffer.consumed()
    }

    /// linger を実行時に変更する（以後のタイムアウト判定にのみ影響）
    pub fn set_linger_ms(&mut self, linger_ms: u64) {
        self.linger = Duration::from_millis(linger_ms);
    }
}
