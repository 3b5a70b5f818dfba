use anyhow::{Context, Result};
use env_logger::Env;
use kikitori::audio_input::MicSource;
use kikitori::config::Config;
use kikitori::session::CaptureSession;
use kikitori::whisper_api::WhisperApiRecognizer;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .init();
        MicSource::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;

    // ロガーを初期化（レベルは設定ファイルで上書き可能）
    env_logger::Builder::from_env(Env::default().default_filter_or(&config.output.log_level))
        .format_timestamp(None)
        .init();

    log::info!("kikitori を起動します");
    log::info!("設定: {:?}", config);

    // 認識バックエンドを構築
    let whisper_config = config
        .whisper
        .clone()
        .context("whisper セクションが未設定です（--generate-config で雛形を生成できます）")?;
    let recognizer = Arc::new(WhisperApiRecognizer::new(whisper_config)?);

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // セッションを開始
    let source = Box::new(MicSource::new(&config.audio));
    let session = CaptureSession::start(&config, source, recognizer)?;

    log::info!("録音を開始しました (Ctrl+C で停止)");

    // メインループ: 停止を待つ
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    // クリーンアップ: 蓄積中の発話も確定してから畳む
    session.request_flush();
    let store = session.stop().await?;

    // 最終結果を JSON 形式で出力
    for entry in store.entries() {
        if let Ok(json) = serde_json::to_string(&entry) {
            println!("{}", json);
        }
    }

    log::info!("kikitori を終了しました");

    Ok(())
}
