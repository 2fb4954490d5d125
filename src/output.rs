//! worker 输出的分段读取
//!
//! FFmpeg 的进度行 (`frame=... speed=1x`) 以 `\r` 结尾反复覆盖同一行，
//! 按 `\n` 分行会把整个运行期的进度累积成一行。这里以 `\r` 或 `\n`
//! 作为记录分隔符，并限制单条记录的长度。

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 单条记录的最大字节数，超出部分截断成新记录
pub const MAX_RECORD_LEN: usize = 1024;

pub struct OutputRecordReader<R> {
    reader: R,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    /// 读取下一条非空记录，流结束返回 `None`
    ///
    /// 状态全部保存在 `self` 中，future 被取消后重新调用不会丢数据。
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| matches!(b, b'\n' | b'\r')) {
                let record = take_record(&mut self.pending, idx);
                consume_delimiters(&mut self.pending);
                match record {
                    Some(record) => return Ok(Some(record)),
                    None => continue,
                }
            }
            if self.pending.len() >= MAX_RECORD_LEN {
                if let Some(record) = take_record(&mut self.pending, MAX_RECORD_LEN) {
                    return Ok(Some(record));
                }
                continue;
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let len = self.pending.len().min(MAX_RECORD_LEN);
                let record = take_record(&mut self.pending, len);
                self.pending.clear();
                return Ok(record);
            }
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

fn take_record(buf: &mut Vec<u8>, len: usize) -> Option<String> {
    let bytes: Vec<u8> = buf.drain(..len).collect();
    let record = String::from_utf8_lossy(&bytes).trim().to_string();
    (!record.is_empty()).then_some(record)
}

fn consume_delimiters(buf: &mut Vec<u8>) {
    let n = buf
        .iter()
        .take_while(|&&b| matches!(b, b'\n' | b'\r'))
        .count();
    buf.drain(..n);
}
