use bytes::{Buf, BufMut, BytesMut};

/// 带读写游标的字节缓冲区。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 收发器的 `read`/`write` 以“尽力而为”的方式推进：一次调用可能只完成部分字节，
///   剩余部分由下一次就绪事件继续处理，因此缓冲区必须记住当前位置；
/// - 统一读写两个方向的表达：写入时 `[position, len)` 是待发送数据，读取时 `[position, len)`
///   是待填充空间。
///
/// ## 契约（What）
/// - `remaining()`：尚未处理的字节数；为 0 表示本次操作已经完成；
/// - `advance(n)`：前移游标，`n` 不得超过 `remaining()`；
/// - `resize(len)`：调整总长度并把游标复位到 0，常用于预先声明“期望读取多少字节”。
///
/// ## 风险与权衡（Trade-offs）
/// - 底层以 [`BytesMut`] 存储，`freeze` 时可零拷贝转换为 `Bytes`；
/// - 不做容量上限检查，调用方需根据消息头自行约束 `resize` 的长度。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    data: BytesMut,
    position: usize,
}

impl Buffer {
    /// 创建空缓冲区。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建长度为 `len`、内容全零的缓冲区，通常用作读取目标。
    pub fn with_len(len: usize) -> Self {
        let mut data = BytesMut::with_capacity(len);
        data.resize(len, 0);
        Self { data, position: 0 }
    }

    /// 以已有数据构造待写出的缓冲区。
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            position: 0,
        }
    }

    /// 当前游标位置。
    pub fn position(&self) -> usize {
        self.position
    }

    /// 手动设置游标位置。
    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.data.len(), "position beyond buffer length");
        self.position = position;
    }

    /// 缓冲区总长度。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 缓冲区是否为空。
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 剩余待处理的字节数。
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// 是否还有待处理字节。
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// 前移游标。
    pub fn advance(&mut self, count: usize) {
        assert!(count <= self.remaining(), "advance beyond buffer length");
        self.position += count;
    }

    /// 调整长度并复位游标。
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        self.position = 0;
    }

    /// 清空数据与游标。
    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
    }

    /// 追加数据，不移动游标。
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    /// 尚未处理的只读区间。
    pub fn unread(&self) -> &[u8] {
        &self.data[self.position..]
    }

    /// 尚未填充的可写区间。
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.position..]
    }

    /// 已处理（已写出或已读入）的区间。
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.position]
    }

    /// 完整内容。
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 取出底层存储。
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// 从 [`Buf`] 中尽量填满剩余空间，返回复制的字节数。
    pub fn fill_from<B: Buf>(&mut self, source: &mut B) -> usize {
        let count = self.remaining().min(source.remaining());
        source.copy_to_slice(&mut self.data[self.position..self.position + count]);
        self.position += count;
        count
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&value[..]),
            position: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cursor_tracks_partial_progress() {
        let mut buf = Buffer::with_len(8);
        buf.unfilled_mut()[..3].copy_from_slice(b"abc");
        buf.advance(3);
        assert_eq!(buf.remaining(), 5);
        assert_eq!(buf.filled(), b"abc");

        buf.resize(2);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn fill_from_copies_at_most_remaining() {
        let mut buf = Buffer::with_len(4);
        let mut source: &[u8] = b"hello world";
        assert_eq!(buf.fill_from(&mut source), 4);
        assert_eq!(buf.as_slice(), b"hell");
        assert_eq!(source, b"o world");
        assert!(!buf.has_remaining());
    }
}
