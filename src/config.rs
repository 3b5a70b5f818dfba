use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    pub whisper: Option<WhisperConfig>,
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

/// オーディオ入力設定
///
/// オーディオデバイスからの入力に関する設定。
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 16000 Hz (16kHz モノラル固定)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

/// VAD (Voice Activity Detection) 設定
///
/// 内蔵のエネルギーベース VAD に関する設定。
///
/// # デフォルト値
///
/// - `threshold_db`: -40.0 dB
/// - `hangover_duration_ms`: 300 ms
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VadConfig {
    #[serde(default = "default_threshold_db")]
    pub threshold_db: f32,
    #[serde(default = "default_hangover_duration_ms")]
    pub hangover_duration_ms: u32,
}

/// 発話終端判定 (エンドポインティング) 設定
///
/// 無音タイムアウト・部分認識の周期・保存モードを指定する。
/// 値の変更は以後のタイムアウト判定にのみ影響する。
///
/// # デフォルト値
///
/// - `linger_ms`: 800 ms (発話終端とみなす無音時間)
/// - `partial_interval_ms`: 500 ms (部分認識の周期、目安 200〜1000)
/// - `preroll_ms`: 500 ms (full-window 保存時の前後パディング)
/// - `save_vad_segments_only`: false (生バッファの full-window を保存)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    #[serde(default = "default_partial_interval_ms")]
    pub partial_interval_ms: u64,
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u64,
    #[serde(default = "default_save_vad_segments_only")]
    pub save_vad_segments_only: bool,
}

/// Whisper 互換 API 認識バックエンド設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhisperConfig {
    /// API Key
    pub api_key: String,
    /// モデル名（通常 "whisper-1"）
    #[serde(default = "default_whisper_model")]
    pub model: String,
    /// 言語コード（"ja", "en" など）。省略可能
    pub language: Option<String>,
    /// エンドポイント URL
    #[serde(default = "default_whisper_endpoint")]
    pub endpoint: String,
}

/// リモート候補取得サービス (エンリッチメント) 設定
///
/// このセクションを省略するとエンリッチメントは無効になり、
/// 確定した発話はキューに投入されない（オフライン／データ収集モード）。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// 候補取得サービスの URL
    pub endpoint: String,
    /// リクエストに付与するユーザ ID
    pub user_id: String,
    /// 取得する候補数
    #[serde(default = "default_candidate_count")]
    pub candidate_count: u32,
    /// エンリッチメントを有効にするかどうか
    #[serde(default = "default_remote_enabled")]
    pub enabled: bool,
}

/// 出力設定
///
/// 発話 WAV/サイドカーの保存先とログに関する設定。
///
/// # デフォルト値
///
/// - `utterance_dir`: "./utterances"
/// - `log_level`: "info"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_utterance_dir")]
    pub utterance_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000 // 16kHz モノラル固定
}

fn default_threshold_db() -> f32 {
    -40.0
}

fn default_hangover_duration_ms() -> u32 {
    300
}

fn default_linger_ms() -> u64 {
    800
}

fn default_partial_interval_ms() -> u64 {
    500
}

fn default_preroll_ms() -> u64 {
    500
}

fn default_save_vad_segments_only() -> bool {
    false
}

fn default_whisper_model() -> String {
    "whisper-1".to_string()
}

fn default_whisper_endpoint() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}

fn default_candidate_count() -> u32 {
    5
}

fn default_remote_enabled() -> bool {
    true
}

fn default_utterance_dir() -> String {
    "./utterances".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            endpoint: EndpointConfig::default(),
            whisper: None, // デフォルトでは認識バックエンド設定なし
            remote: None,  // デフォルトではエンリッチメント無効
            output: OutputConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold_db: default_threshold_db(),
            hangover_duration_ms: default_hangover_duration_ms(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            linger_ms: default_linger_ms(),
            partial_interval_ms: default_partial_interval_ms(),
            preroll_ms: default_preroll_ms(),
            save_vad_segments_only: default_save_vad_segments_only(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            utterance_dir: default_utterance_dir(),
            log_level: default_log_level(),
        }
    }
}

impl EndpointConfig {
    /// プリロールをサンプル数に変換
    pub fn preroll_samples(&self, sample_rate: u32) -> usize {
        (self.preroll_ms * sample_rate as u64 / 1000) as usize
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use kikitori::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// デフォルト値を持つ設定ファイルを生成する。
    /// 既存のファイルは上書きされる。
    ///
    /// # Errors
    ///
    /// ファイルの書き込みに失敗した場合にエラーを返す。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// ファイルが存在するがパースに失敗した場合のみエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use kikitori::config::Config;
    /// let config = Config::load_or_default("config.toml").unwrap();
    /// ```
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}
