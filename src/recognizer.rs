use crate::types::Sample;
use anyhow::Result;
use async_trait::async_trait;

/// 認識ストリームのハンドル
pub type StreamId = u64;

/// 音声認識器の契約
///
/// ストリームを作成し、音声を供給してデコードし、結果テキストを
/// 取り出す。ストリームはどの終了経路でも必ず `release` される
/// （デコード失敗時も含む）。実装は共有されるため `&self` で
/// 内部可変性を持つ。
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// 新しい認識ストリームを作成
    async fn create_stream(&self) -> Result<StreamId>;

    /// ストリームに音声を供給
    async fn accept_waveform(
        &self,
        stream: StreamId,
        samples: &[Sample],
        sample_rate: u32,
    ) -> Result<()>;

    /// 供給済み音声をデコード
    async fn decode(&self, stream: StreamId) -> Result<()>;

    /// デコード結果のテキストを取得
    async fn result(&self, stream: StreamId) -> Result<String>;

    /// ストリームのリソースを解放
    async fn release(&self, stream: StreamId);
}

/// 1回分のデコードサイクルを実行する
///
/// ストリーム作成から解放までを1回で行う。`release` は成功・失敗の
/// どちらの経路でも必ず呼ばれる。失敗時はそのサイクルの結果だけが
/// 失われ、発話データ自体は失われない。
pub async fn decode_utterance(
    recognizer: &dyn Recognizer,
    samples: &[Sample],
    sample_rate: u32,
) -> Result<String> {
    let stream = recognizer.create_stream().await?;

    let outcome = async {
        recognizer
            .accept_waveform(stream, samples, sample_rate)
            .await?;
        recognizer.decode(stream).await?;
        recognizer.result(stream).await
    }
    .await;

    // 失敗時も必ず解放する
    recognizer.release(stream).await;

    outcome
}
