use serde::{Deserialize, Serialize};

/// 正規化済みオーディオサンプル
///
/// -1.0 から 1.0 の範囲に正規化された振幅値。
/// キャプチャ層で正規化済みのデータのみを扱う。
pub type Sample = f32;

/// VAD に入力する固定ウィンドウサイズ（サンプル数）
///
/// バッファはこの単位でスライスされ、各ウィンドウは一度だけ VAD に渡される。
pub const VAD_WINDOW_SIZE: usize = 512;

/// 1回のキャプチャ読み出しで得られるサンプル列
///
/// 生成後は不変。キャプチャタスクから処理タスクへ
/// チャンネル経由で受け渡される。
#[derive(Clone, Debug)]
pub struct FrameBlock {
    /// 正規化済みモノラルサンプル
    pub samples: Vec<Sample>,
}

/// VAD が出力した連続音声区間
///
/// 1つの発話は複数の SpeechSegment から構成される。
/// 出力後は不変で、到着順が保持される。
#[derive(Clone, Debug, PartialEq)]
pub struct SpeechSegment {
    /// 音声区間のサンプル列
    pub samples: Vec<Sample>,
}

impl SpeechSegment {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// サンプル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// エンドポインタの観測可能な状態
///
/// `Idle → SpeechActive → Lingering → (確定) → Idle` と遷移する。
/// 確定処理は同期的に完了するため、外部から観測できるのは
/// この3状態のみ。
///
/// # Examples
///
/// ```
/// # use kikitori::types::EndpointState;
/// // 無音待機中（カウントダウン進捗 40%）
/// let state = EndpointState::Lingering { progress: 0.4 };
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EndpointState {
    /// 音声未検出
    ///
    /// バッファに未消費データが残っていてもよい
    Idle,

    /// 音声区間を蓄積中
    SpeechActive,

    /// 無音タイムアウト待ち
    ///
    /// セグメントが蓄積済みで、最後のセグメント到着からの経過時間が
    /// linger 閾値に達していない状態。UI 表示用にカウントダウン進捗
    /// （0.0〜1.0）を公開する。
    Lingering {
        /// `経過時間 / linger_ms` を 0.0〜1.0 にクランプした値
        progress: f32,
    },
}

/// 確定した1発話の音声データ
///
/// エンドポインタが発話終端を判定した時点で生成される。
/// 認識用音声と保存用音声は保存モードによって異なる（設定
/// `save_vad_segments_only` 参照）。
#[derive(Clone, Debug)]
pub struct FinalizedUtterance {
    /// 認識に使う音声: VAD セグメントを到着順に連結したもの
    pub recognition_samples: Vec<Sample>,

    /// ディスクに保存する音声
    ///
    /// segments-only モードでは recognition_samples と同一。
    /// full-window モードでは生バッファの
    /// `speech_start .. 最終セグメント終端 + プリロール` 区間。
    pub persist_samples: Vec<Sample>,
}

/// 文字起こし結果の1エントリ
///
/// PartialDecodeScheduler が暫定エントリとして作成するか、
/// 発話確定時に正式エントリとして作成される。確定後はユーザ編集と
/// エンリッチメントのマージ（remote_candidates への追記）のみが許される。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranscriptEntry {
    /// 認識されたテキスト
    pub recognized_text: String,

    /// ユーザ修正後のテキスト（初期値は recognized_text と同じ）
    pub modified_text: String,

    /// 保存された WAV ファイルのパス（保存失敗時は空文字列）
    pub wav_path: String,

    /// ユーザ確認済みかどうか
    pub checked: bool,

    /// 編集可能かどうか（認識処理中は false）
    pub mutable: bool,

    /// リモート認識サービスから取得した候補文（追記のみ）
    pub remote_candidates: Vec<String>,
}

impl TranscriptEntry {
    /// 暫定エントリを作成（部分認識結果用）
    ///
    /// WAV パスは未定で、編集不可の状態で作成される。
    pub fn provisional(text: String) -> Self {
        Self {
            modified_text: text.clone(),
            recognized_text: text,
            wav_path: String::new(),
            checked: false,
            mutable: false,
            remote_candidates: Vec::new(),
        }
    }
}

/// エンリッチメントワーカーへの作業依頼
///
/// 発話確定時に生成され、ワーカーが1回だけ消費する。
/// サイドカーに候補が既にある場合はリモート呼び出しを省略する
/// （冪等性）。
#[derive(Clone, Debug)]
pub struct EnrichmentTask {
    /// 対象 WAV ファイルのパス
    pub wav_path: String,

    /// リモートサービスに渡すユーザ ID
    pub user_id: String,

    /// 確定時点の認識テキスト
    pub original_text: String,

    /// 確定時点の表示テキスト（ユーザ修正を反映）
    pub current_text: String,
}

/// サイドカーレコード（WAV と対になる永続メタデータ）
///
/// WAV と同じベース名の `.jsonl` ファイルに JSON 1件として保存される。
/// WAV とサイドカーは必ずペアで作成・削除され、片方だけが存在する
/// 状態はデータ整合性違反として扱う。
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SidecarRecord {
    /// 認識されたテキスト
    pub original: String,

    /// ユーザ修正後のテキスト
    pub modified: String,

    /// ユーザ確認済みかどうか
    pub checked: bool,

    /// 編集可能かどうか
    pub mutable: bool,

    /// リモート候補文（エンリッチメント前は省略）
    #[serde(
        rename = "remoteCandidates",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub remote_candidates: Option<Vec<String>>,
}

impl SidecarRecord {
    /// 確定直後の発話のサイドカーレコードを作成
    pub fn new(text: &str) -> Self {
        Self {
            original: text.to_string(),
            modified: text.to_string(),
            checked: false,
            mutable: true,
            remote_candidates: None,
        }
    }

    /// 有効な候補を保持しているかどうか
    pub fn has_candidates(&self) -> bool {
        self.remote_candidates
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }
}
