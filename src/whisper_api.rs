use crate::config::WhisperConfig;
use crate::recognizer::{Recognizer, StreamId};
use crate::types::Sample;
use crate::wav;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Whisper API レスポンス
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Whisper 互換 API の認識バックエンド
///
/// ストリームごとに音声を蓄積し、decode 時に WAV へ変換して
/// 文字起こしエンドポイントに送信する。部分認識は累積バッファを
/// 毎回デコードし直す方式のため、1回の decode = 1回の API 呼び出し。
pub struct WhisperApiRecognizer {
    config: WhisperConfig,
    client: reqwest::Client,
    next_id: AtomicU64,

    /// ストリームごとの蓄積音声 (サンプル列, サンプルレート)
    streams: Mutex<HashMap<StreamId, (Vec<Sample>, u32)>>,

    /// decode 済みの結果テキスト
    results: Mutex<HashMap<StreamId, String>>,
}

impl WhisperApiRecognizer {
    pub fn new(config: WhisperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Whisper API HTTPクライアント作成失敗")?;

        Ok(Self {
            config,
            client,
            next_id: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        })
    }

    /// Whisper APIを呼び出して文字起こし
    async fn transcribe_audio(&self, wav_data: Vec<u8>) -> Result<String> {
        let part = multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());

        if let Some(ref language) = self.config.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .multipart(form)
            .send()
            .await
            .context("Whisper API リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Whisper API エラー: {} - {}", status, error_text);
        }

        let whisper_response: WhisperResponse = response
            .json::<WhisperResponse>()
            .await
            .context("Whisper API レスポンスパース失敗")?;

        Ok(whisper_response.text)
    }
}

#[async_trait]
impl Recognizer for WhisperApiRecognizer {
    async fn create_stream(&self) -> Result<StreamId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .unwrap()
            .insert(id, (Vec::new(), 16000));
        Ok(id)
    }

    async fn accept_waveform(
        &self,
        stream: StreamId,
        samples: &[Sample],
        sample_rate: u32,
    ) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        let entry = streams
            .get_mut(&stream)
            .with_context(|| format!("不明なストリーム: {}", stream))?;
        entry.0.extend_from_slice(samples);
        entry.1 = sample_rate;
        Ok(())
    }

    async fn decode(&self, stream: StreamId) -> Result<()> {
        let (samples, sample_rate) = {
            let streams = self.streams.lock().unwrap();
            let entry = streams
                .get(&stream)
                .with_context(|| format!("不明なストリーム: {}", stream))?;
            (entry.0.clone(), entry.1)
        };

        if samples.is_empty() {
            self.results.lock().unwrap().insert(stream, String::new());
            return Ok(());
        }

        let wav_data = wav::wav_bytes(&samples, sample_rate)?;
        log::debug!(
            "Whisper API: {} サンプル ({} バイト) を文字起こし中",
            samples.len(),
            wav_data.len()
        );

        let text = self.transcribe_audio(wav_data).await?;
        self.results.lock().unwrap().insert(stream, text);
        Ok(())
    }

    async fn result(&self, stream: StreamId) -> Result<String> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .get(&stream)
            .cloned()
            .unwrap_or_default())
    }

    async fn release(&self, stream: StreamId) {
        self.streams.lock().unwrap().remove(&stream);
        self.results.lock().unwrap().remove(&stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WhisperConfig {
        WhisperConfig {
            api_key: "sk-test".to_string(),
            model: "whisper-1".to_string(),
            language: Some("ja".to_string()),
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stream_accumulates_waveform() {
        let recognizer = WhisperApiRecognizer::new(test_config()).unwrap();

        let stream = recognizer.create_stream().await.unwrap();
        recognizer
            .accept_waveform(stream, &[0.1; 800], 16000)
            .await
            .unwrap();
        recognizer
            .accept_waveform(stream, &[0.2; 800], 16000)
            .await
            .unwrap();

        let streams = recognizer.streams.lock().unwrap();
        assert_eq!(streams.get(&stream).unwrap().0.len(), 1600);
    }

    #[tokio::test]
    async fn test_release_clears_stream_state() {
        let recognizer = WhisperApiRecognizer::new(test_config()).unwrap();

        let stream = recognizer.create_stream().await.unwrap();
        recognizer
            .accept_waveform(stream, &[0.1; 160], 16000)
            .await
            .unwrap();
        recognizer.release(stream).await;

        assert!(recognizer.streams.lock().unwrap().is_empty());
        // 解放後のストリームへの供給はエラー
        assert!(recognizer
            .accept_waveform(stream, &[0.1; 160], 16000)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_decode_empty_stream_yields_blank() {
        let recognizer = WhisperApiRecognizer::new(test_config()).unwrap();

        let stream = recognizer.create_stream().await.unwrap();
        // 音声未供給なら API を呼ばずに空文字列
        recognizer.decode(stream).await.unwrap();
        assert_eq!(recognizer.result(stream).await.unwrap(), "");
    }
}
