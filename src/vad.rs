use crate::config::VadConfig;
use crate::types::{Sample, SpeechSegment};
use std::collections::VecDeque;

/// 音声区間検出器の契約
///
/// 固定サイズのウィンドウを受け取り、音声/無音を判定し、
/// 連続音声区間を SpeechSegment としてキューに出力する。
/// 実装は内蔵のエネルギーベース VAD でも外部モデルでもよい。
pub trait Vad: Send {
    /// 固定サイズのウィンドウを1つ入力
    fn accept_waveform(&mut self, window: &[Sample]);

    /// 直近のウィンドウ処理後に音声区間中かどうか
    fn is_speech_detected(&self) -> bool;

    /// 出力待ちのセグメントがあるかどうか
    fn has_queued_segment(&self) -> bool;

    /// キュー先頭のセグメントを取り出す
    fn pop_segment(&mut self) -> Option<SpeechSegment>;

    /// 内部状態とキューをクリア
    fn reset(&mut self);
}

/// VAD の内部状態（無音/音声）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VadState {
    /// 無音状態
    Silence,

    /// 音声状態
    ///
    /// ハングオーバー残り時間（ミリ秒）を保持する。
    /// 音声が検出されなくなっても、この時間が経過するまでは
    /// 音声状態を維持する。
    Voice { hangover_remaining_ms: u32 },
}

/// エネルギーベースの音声区間検出器
///
/// RMS (Root Mean Square) ベースのシンプルなVAD実装。
/// 音声パワーが閾値を超えたら音声区間と判定し、
/// 下回ってもハングオーバー期間は音声継続とみなす。
/// 音声状態の間に受け取ったウィンドウは蓄積され、
/// 無音に遷移した時点で1つの SpeechSegment としてキューに積まれる。
///
/// # アルゴリズム
///
/// 1. RMS (二乗平均平方根) を計算
/// 2. デシベル (dB) に変換: `20 * log10(rms)`
/// 3. 閾値と比較して音声/無音を判定
/// 4. ハングオーバー機構により急激な変化を抑制
///
/// # Examples
///
/// ```
/// # use kikitori::vad::{EnergyVad, Vad};
/// # use kikitori::config::VadConfig;
/// let config = VadConfig {
///     threshold_db: -40.0,
///     hangover_duration_ms: 300,
/// };
/// let mut vad = EnergyVad::new(&config, 16000);
///
/// // 無音ウィンドウ
/// vad.accept_waveform(&vec![0.0f32; 512]);
/// assert!(!vad.is_speech_detected());
/// ```
pub struct EnergyVad {
    /// 音声判定の閾値 (dB)
    threshold_db: f32,

    /// ハングオーバー期間 (ミリ秒)
    hangover_duration_ms: u32,

    /// 現在の状態 (無音/音声)
    state: VadState,

    /// サンプリングレート (Hz)
    ///
    /// 時間計算に使用
    sample_rate: u32,

    /// 音声区間中に蓄積しているサンプル
    pending: Vec<Sample>,

    /// 出力待ちのセグメント（到着順）
    queued: VecDeque<SpeechSegment>,
}

impl EnergyVad {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            threshold_db: config.threshold_db,
            hangover_duration_ms: config.hangover_duration_ms,
            state: VadState::Silence,
            sample_rate,
            pending: Vec::new(),
            queued: VecDeque::new(),
        }
    }

    /// RMS (Root Mean Square) を計算
    fn calculate_rms(samples: &[Sample]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let sum_of_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let mean_square = sum_of_squares / samples.len() as f64;
        mean_square.sqrt() as f32
    }

    /// RMSをデシベル (dB) に変換
    fn rms_to_db(rms: f32) -> f32 {
        if rms <= 0.0 {
            return -100.0; // 無音の場合の最小値
        }
        20.0 * rms.log10()
    }
}

impl Vad for EnergyVad {
    fn accept_waveform(&mut self, window: &[Sample]) {
        if window.is_empty() {
            return;
        }

        let rms = Self::calculate_rms(window);
        let db = Self::rms_to_db(rms);

        // ウィンドウ長から経過時間を計算（ミリ秒）
        let duration_ms = (window.len() as f64 / self.sample_rate as f64 * 1000.0) as u32;

        let is_voice_detected = db > self.threshold_db;

        // 状態遷移
        self.state = match self.state {
            VadState::Silence => {
                if is_voice_detected {
                    log::debug!("VAD: 音声開始検出 (RMS: {:.2} dB)", db);
                    VadState::Voice {
                        hangover_remaining_ms: self.hangover_duration_ms,
                    }
                } else {
                    VadState::Silence
                }
            }
            VadState::Voice {
                hangover_remaining_ms,
            } => {
                if is_voice_detected {
                    // 音声が継続している場合、ハングオーバーをリセット
                    VadState::Voice {
                        hangover_remaining_ms: self.hangover_duration_ms,
                    }
                } else if hangover_remaining_ms > duration_ms {
                    // 音声が検出されなくなった場合、ハングオーバーをカウントダウン
                    VadState::Voice {
                        hangover_remaining_ms: hangover_remaining_ms - duration_ms,
                    }
                } else {
                    log::debug!("VAD: 音声終了検出 (RMS: {:.2} dB)", db);
                    VadState::Silence
                }
            }
        };

        match self.state {
            VadState::Voice { .. } => {
                // ハングオーバー中のウィンドウもセグメントに含める
                self.pending.extend_from_slice(window);
            }
            VadState::Silence => {
                if !self.pending.is_empty() {
                    let segment = SpeechSegment::new(std::mem::take(&mut self.pending));
                    log::debug!("VAD: セグメント出力 ({} サンプル)", segment.len());
                    self.queued.push_back(segment);
                }
            }
        }
    }

    fn is_speech_detected(&self) -> bool {
        matches!(self.state, VadState::Voice { .. })
    }

    fn has_queued_segment(&self) -> bool {
        !self.queued.is_empty()
    }

    fn pop_segment(&mut self) -> Option<SpeechSegment> {
        self.queued.pop_front()
    }

    fn reset(&mut self) {
        self.state = VadState::Silence;
        self.pending.clear();
        self.queued.clear();
    }
}

/// テスト用のスクリプト駆動 VAD
///
/// ウィンドウごとの判定とセグメント出力をあらかじめ指示しておく。
/// 指示が尽きた後のウィンドウは無音として扱う。
#[cfg(test)]
pub(crate) struct ScriptedVad {
    plan: VecDeque<WindowAction>,
    queued: VecDeque<SpeechSegment>,
    speech: bool,
}

#[cfg(test)]
#[derive(Clone, Debug)]
pub(crate) struct WindowAction {
    pub speech: bool,
    pub emit: Option<SpeechSegment>,
}

#[cfg(test)]
impl ScriptedVad {
    pub fn new(plan: Vec<WindowAction>) -> Self {
        Self {
            plan: plan.into(),
            queued: VecDeque::new(),
            speech: false,
        }
    }

    /// 音声判定のみのウィンドウ指示
    pub fn speech(on: bool) -> WindowAction {
        WindowAction {
            speech: on,
            emit: None,
        }
    }

    /// このウィンドウ処理後にセグメントを出力する指示
    ///
    /// 実際の VAD は音声→無音の遷移でセグメントを出すため、
    /// このウィンドウ自体は無音として扱う。
    pub fn emit(samples: Vec<Sample>) -> WindowAction {
        WindowAction {
            speech: false,
            emit: Some(SpeechSegment::new(samples)),
        }
    }
}

#[cfg(test)]
impl Vad for ScriptedVad {
    fn accept_waveform(&mut self, _window: &[Sample]) {
        match self.plan.pop_front() {
            Some(action) => {
                self.speech = action.speech;
                if let Some(segment) = action.emit {
                    self.queued.push_back(segment);
                }
            }
            None => self.speech = false,
        }
    }

    fn is_speech_detected(&self) -> bool {
        self.speech
    }

    fn has_queued_segment(&self) -> bool {
        !self.queued.is_empty()
    }

    fn pop_segment(&mut self) -> Option<SpeechSegment> {
        self.queued.pop_front()
    }

    fn reset(&mut self) {
        self.plan.clear();
        self.queued.clear();
        self.speech = false;
    }
}
