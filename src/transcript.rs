use crate::types::TranscriptEntry;
use std::sync::{Arc, Mutex};

/// テキストが空白のみかどうか
fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// 発話完了順の文字起こしエントリの唯一のコレクション
///
/// 処理タスク（部分認識・確定）とエンリッチメントワーカーの両方が
/// 書き込むため、すべての変更は1つのミューテックス越しに直列化される。
/// ハンドルは Clone 可能で、各タスクが同じ内部状態を共有する。
///
/// 変更操作は3種類:
/// - `provisional_update`: 末尾の暫定エントリをその位置で置き換える
/// - `finalize_entry`: 発話確定時の正式レコードを適用する
/// - `merge_candidates`: エンリッチメント結果を wav_path で突き合わせて追記する
#[derive(Clone)]
pub struct TranscriptStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    entries: Vec<TranscriptEntry>,

    /// 現在の発話試行に対する暫定エントリの位置
    ///
    /// 暫定エントリは自分の位置でのみ置き換えられ、並び替えられない
    provisional_index: Option<usize>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                entries: Vec::new(),
                provisional_index: None,
            })),
        }
    }

    /// 部分認識結果を反映する
    ///
    /// 現在の発話試行に暫定エントリがあればその位置で置き換え、
    /// なければ新しい暫定エントリを作成する。空白のみの結果は破棄される。
    pub fn provisional_update(&self, text: &str) {
        if is_blank(text) {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.provisional_index {
            Some(index) => {
                let entry = &mut inner.entries[index];
                entry.recognized_text = text.to_string();
                entry.modified_text = text.to_string();
            }
            None => {
                inner
                    .entries
                    .push(TranscriptEntry::provisional(text.to_string()));
                inner.provisional_index = Some(inner.entries.len() - 1);
            }
        }
    }

    /// 確定テキストを解決する（変更なしの読み取り）
    ///
    /// 空白の確定結果は非空白の暫定キャプションを上書きしない。
    /// 暫定キャプションがあればそのテキストを維持する。
    pub fn resolve_final_text(&self, final_text: &str) -> String {
        let inner = self.inner.lock().unwrap();
        if is_blank(final_text) {
            if let Some(index) = inner.provisional_index {
                let provisional = &inner.entries[index].recognized_text;
                if !is_blank(provisional) {
                    return provisional.clone();
                }
            }
        }
        final_text.to_string()
    }

    /// 発話確定時の正式レコードを適用する
    ///
    /// 暫定エントリがあればその位置で置き換え、なければ末尾に追加する。
    /// テキストも WAV パスも空のレコードは何も作らない。
    /// 適用後のエントリ（エンリッチメント依頼用）を返す。
    pub fn finalize_entry(&self, text: &str, wav_path: &str) -> Option<TranscriptEntry> {
        let mut inner = self.inner.lock().unwrap();

        let entry = TranscriptEntry {
            recognized_text: text.to_string(),
            modified_text: text.to_string(),
            wav_path: wav_path.to_string(),
            checked: false,
            mutable: true,
            remote_candidates: Vec::new(),
        };

        match inner.provisional_index.take() {
            Some(index) => {
                inner.entries[index] = entry.clone();
                Some(entry)
            }
            None => {
                if is_blank(text) && wav_path.is_empty() {
                    log::debug!("空の確定結果を破棄（音声もテキストもなし）");
                    None
                } else {
                    inner.entries.push(entry.clone());
                    Some(entry)
                }
            }
        }
    }

    /// エンリッチメント結果を突き合わせて追記する
    ///
    /// エントリは位置ではなく wav_path で特定する（並び替えに耐える）。
    /// 候補は追記のみで、既存の候補は置き換えられない。
    /// 対象が見つからなければ false を返す。
    pub fn merge_candidates(&self, wav_path: &str, candidates: &[String]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .entries
            .iter_mut()
            .find(|e| !e.wav_path.is_empty() && e.wav_path == wav_path)
        {
            Some(entry) => {
                entry
                    .remote_candidates
                    .extend(candidates.iter().cloned());
                true
            }
            None => false,
        }
    }

    /// ユーザ編集を適用する
    ///
    /// 確定済みエントリを wav_path で特定し、クロージャで変更する。
    pub fn edit_entry<F>(&self, wav_path: &str, f: F) -> bool
    where
        F: FnOnce(&mut TranscriptEntry),
    {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .entries
            .iter_mut()
            .find(|e| !e.wav_path.is_empty() && e.wav_path == wav_path)
        {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// 全エントリのスナップショットを取得
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// エントリ数
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// エントリが無いかどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}
