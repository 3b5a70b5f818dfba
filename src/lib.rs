//! kikitori - ストリーミング・ディクテーションパイプライン
//!
//! このクレートは、マイク入力から音声を受信し、VAD による発話終端
//! 判定（エンドポインティング）を行いながらリアルタイムに文字起こし
//! するシステムを提供します。
//!
//! # 主な機能
//!
//! - **VAD エンドポインティング**: 無音タイムアウトで発話を自動確定
//! - **部分認識**: 発話中の累積音声を周期的に認識し、暫定字幕として表示
//! - **発話の永続化**: 確定した発話を WAV + サイドカー (JSONL) のペアで保存
//! - **エンリッチメント**: 確定後にリモートサービスから候補文を非同期取得
//! - **Whisper API 連携**: OpenAI 互換エンドポイントによる音声認識
//!
//! # アーキテクチャ
//!
//! ```text
//! [Microphone] → [MicSource] → [Pipeline]
//!                                   │
//!                          ┌────────┴────────┐
//!                          │                 │
//!                    [Endpointer]      [Recognizer]
//!                     (VAD + 終端判定)   (部分/最終認識)
//!                          │                 │
//!                          ↓                 ↓
//!                    [WAV + サイドカー]  [TranscriptStore]
//!                          │
//!                          ↓
//!                   [EnrichmentWorker] → 候補文マージ
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use kikitori::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_input;
pub mod buffer;
pub mod config;
pub mod endpointer;
pub mod enrichment;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod sidecar;
pub mod transcript;
pub mod types;
pub mod vad;
pub mod wav;
pub mod whisper_api;
