use crate::config::AudioConfig;
use crate::types::FrameBlock;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use regex_lite::Regex;
use std::time::Duration;

/// コールバックと read() の間のフレームバッファ容量
const FRAME_QUEUE_CAPACITY: usize = 64;

/// read() のブロッキング上限
///
/// タイムアウトは空読みとして返し、呼び出し側が停止フラグを
/// 確認できるようにする。
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 音声フレームの供給元の契約
///
/// `read` はブロッキングで次のフレームを返す。一時的な読み取り失敗は
/// 空の FrameBlock として返し（呼び出し側はスキップしてループを継続）、
/// ストリーム終端では None を返す。
///
/// 本番実装はマイク入力 (cpal)。テストではスクリプト済みの
/// フレーム列を流すフェイクを差し込む。
pub trait FrameSource: Send {
    /// キャプチャを開始する
    fn start(&mut self) -> Result<()>;

    /// 次のフレームを取得する（ブロッキング）
    ///
    /// 空の FrameBlock は一時的な空読み、None はストリーム終端。
    fn read(&mut self) -> Option<FrameBlock>;

    /// キャプチャを停止する
    ///
    /// 停止後の read は None を返す。
    fn stop(&mut self);
}

/// オーディオデバイスからのマイク入力
///
/// cpal のストリームは Send ではないため、専用スレッドが所有する。
/// コールバックはデバイスのチャンネル数に関わらずモノラルに
/// ダウンミックスし、正規化済み f32 の FrameBlock をキューに積む。
/// `read` はそのキューからブロッキングで取り出す。
pub struct MicSource {
    config: AudioConfig,
    frame_rx: Option<Receiver<FrameBlock>>,
    stop_tx: Option<Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MicSource {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
            frame_rx: None,
            stop_tx: None,
            thread: None,
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// MacBook Air 本体・WebCam など、通常入力デバイスとして利用してはいけないデバイスを除外したデバイス一覧を取得
    fn input_devices() -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()?
            .filter(|device| {
                if let Ok(name) = device.name() {
                    // 除外するデバイス名のリスト
                    let excluded_names_regex = Regex::new("MacBook (Air|Pro)|AirPods|iPhone|Webcam|Background|Microsoft Teams|ZoomAudioDevice").unwrap();
                    if excluded_names_regex.is_match(&name) {
                        return false;
                    }
                    return true;
                } else {
                    true
                }
            })
            .collect();
        Ok(devices)
    }
}

impl FrameSource for MicSource {
    fn start(&mut self) -> Result<()> {
        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let config = self.config.clone();

        // ストリームは Send ではないので、生成から破棄まで
        // このスレッドが所有する
        let thread = std::thread::spawn(move || {
            let stream = match build_capture_stream(&config, frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // 停止要求まで待機
            let _ = stop_rx.recv();
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        });

        ready_rx
            .recv()
            .context("オーディオスレッドが応答しません")??;

        self.frame_rx = Some(frame_rx);
        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);

        log::info!("音声入力ストリームを開始しました");
        Ok(())
    }

    fn read(&mut self) -> Option<FrameBlock> {
        let rx = self.frame_rx.as_ref()?;
        match rx.recv_timeout(READ_TIMEOUT) {
            Ok(block) => Some(block),
            // 一時的な空読み: 呼び出し側がループを継続する
            Err(RecvTimeoutError::Timeout) => Some(FrameBlock {
                samples: Vec::new(),
            }),
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.frame_rx = None;
    }
}

impl Drop for MicSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// デバイスを選択して入力ストリームを構築・開始する
fn build_capture_stream(config: &AudioConfig, frame_tx: Sender<FrameBlock>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    log::info!("オーディオ設定: {:?}", config);

    // デバイスを取得
    let device = if config.device_id == "default" {
        host.default_input_device()
            .context("デフォルト入力デバイスが見つかりません")?
    } else {
        // デバイスIDが指定されている場合は、デバイス一覧から検索
        MicSource::input_devices()?
            .into_iter()
            .find(|d| d.name().ok().as_deref() == Some(&config.device_id))
            .with_context(|| format!("デバイスが見つかりません: {}", config.device_id))?
    };

    log::info!("入力デバイス: {:?}", device.name());

    let default_config = device
        .default_input_config()
        .context("デフォルト入力設定が取得できません")?;

    log::info!(
        "デバイス設定: {:?}, {}Hz, {}ch",
        default_config.sample_format(),
        default_config.sample_rate().0,
        default_config.channels()
    );

    let num_channels = default_config.channels();
    let stream_config = cpal::StreamConfig {
        channels: num_channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(4096),
    };

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, num_channels, frame_tx)?
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, num_channels, frame_tx)?
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, num_channels, frame_tx)?
        }
        cpal::SampleFormat::I32 => {
            build_stream::<i32>(&device, &stream_config, num_channels, frame_tx)?
        }
        _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
    };

    stream.play().context("ストリームの再生開始に失敗")?;
    Ok(stream)
}

/// ストリームを構築
fn build_stream<T>(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    num_channels: u16,
    frame_tx: Sender<FrameBlock>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Sample + Send + 'static,
    <T as Sample>::Float: Into<f32>,
{
    let num_channels = num_channels as usize;

    let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
        // インターリーブされた全チャンネルをモノラルに平均する
        let frames = data.len() / num_channels;
        let mut samples = Vec::with_capacity(frames);
        for frame in 0..frames {
            let mut sum = 0.0f32;
            for ch in 0..num_channels {
                let f: f32 = data[frame * num_channels + ch].to_float_sample().into();
                sum += f;
            }
            samples.push((sum / num_channels as f32).clamp(-1.0, 1.0));
        }

        // コールバックをブロックしない送信（満杯時は破棄）
        match frame_tx.try_send(FrameBlock { samples }) {
            Ok(_) => {
                // 成功時はログ出力しない（パフォーマンス重視）
            }
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                log::warn!("フレーム送信失敗: バッファ満杯");
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                log::warn!("フレーム送信失敗: チャンネルクローズ");
            }
        }
    };

    let error_callback = move |err| {
        log::error!("ストリームエラー: {}", err);
    };

    let stream = device
        .build_input_stream(stream_config, data_callback, error_callback, None)
        .context("入力ストリームの構築に失敗")?;

    Ok(stream)
}
