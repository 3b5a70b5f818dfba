use crate::types::Sample;

/// 現在の発話試行のためのフレームバッファ
///
/// キャプチャされたサンプルを追記専用で蓄積し、VAD に渡した位置を
/// 消費オフセットとして単調に進める。発話が確定した瞬間にリセットされ、
/// 次の発話試行のために空になる。
///
/// # Examples
///
/// ```
/// # use kikitori::buffer::FrameBuffer;
/// let mut buffer = FrameBuffer::new();
/// buffer.append(&[0.0; 600]);
///
/// // 512 サンプルのウィンドウを1つ切り出せる
/// assert!(buffer.has_full_window(512));
/// let window = buffer.take_window(512).unwrap();
/// assert_eq!(window.len(), 512);
/// ```
pub struct FrameBuffer {
    /// 蓄積済みサンプル（追記のみ）
    samples: Vec<Sample>,

    /// VAD に渡し終えた位置
    ///
    /// 単調増加し、同じウィンドウが二度渡されることはない
    consumed_offset: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            consumed_offset: 0,
        }
    }

    /// サンプルを末尾に追加
    pub fn append(&mut self, samples: &[Sample]) {
        self.samples.extend_from_slice(samples);
    }

    /// 未消費部分にフルウィンドウが残っているか
    pub fn has_full_window(&self, window_size: usize) -> bool {
        self.samples.len() - self.consumed_offset >= window_size
    }

    /// 次のウィンドウを切り出して消費オフセットを進める
    ///
    /// フルウィンドウが残っていない場合は None を返し、
    /// オフセットは進まない。
    pub fn take_window(&mut self, window_size: usize) -> Option<&[Sample]> {
        if !self.has_full_window(window_size) {
            return None;
        }
        let start = self.consumed_offset;
        self.consumed_offset += window_size;
        Some(&self.samples[start..self.consumed_offset])
    }

    /// 消費済みオフセット（サンプル数）
    pub fn consumed_offset(&self) -> usize {
        self.consumed_offset
    }

    /// 先頭から消費済み位置までのサンプル列
    ///
    /// 部分認識はこの累積範囲を毎回デコードし直す
    pub fn consumed(&self) -> &[Sample] {
        &self.samples[..self.consumed_offset]
    }

    /// 範囲を切り出す（終端はバッファ長にクランプ）
    pub fn slice(&self, start: usize, end: usize) -> &[Sample] {
        let end = end.min(self.samples.len());
        let start = start.min(end);
        &self.samples[start..end]
    }

    /// バッファ内の総サンプル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// バッファが空かどうか
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// バッファ内のデータ時間（秒）
    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }

    /// バッファと消費オフセットを空に戻す
    pub fn reset(&mut self) {
        self.samples.clear();
        self.consumed_offset = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
