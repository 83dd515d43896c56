//! Reads a byte stream from a child pipe, splits it on LF, and pushes
//! complete lines into a `BoundedLineQueue` producer.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::pipeline::LineProducer;

/// Lines longer than this are split into chunks rather than growing the
/// buffer without bound; each split increments `oversize_lines`.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Reads complete lines out of an async byte stream and forwards them to a
/// `LineProducer`. Partial trailing bytes at EOF (no final `\n`) are
/// discarded, matching the spec: a half-written line at process exit is not
/// meaningful progress/log data.
pub struct LineSource<R> {
    reader: BufReader<R>,
    producer: LineProducer,
    oversize_lines: u64,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
    pub fn new(reader: R, producer: LineProducer) -> Self {
        Self {
            reader: BufReader::new(reader),
            producer,
            oversize_lines: 0,
        }
    }

    /// Number of lines that had to be split because they exceeded
    /// `MAX_LINE_LEN`. Never panics or crashes the process; just counted.
    pub fn oversize_lines(&self) -> u64 {
        self.oversize_lines
    }

    /// Run until the underlying stream errors or hits EOF.
    pub async fn run(mut self) -> u64 {
        let mut buf: Vec<u8> = Vec::with_capacity(256);
        loop {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    } else {
                        // EOF with no trailing newline: discard the partial line.
                        break;
                    }
                    self.emit(std::mem::take(&mut buf));
                }
                Err(_) => break,
            }
        }
        self.oversize_lines
    }

    fn emit(&mut self, line: Vec<u8>) {
        if line.len() <= MAX_LINE_LEN {
            self.producer.push(line);
            return;
        }
        self.oversize_lines += 1;
        for chunk in line.chunks(MAX_LINE_LEN) {
            self.producer.push(chunk.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pipeline::BoundedLineQueue;

    #[tokio::test]
    async fn splits_on_lf_and_strips_cr() {
        let data = b"alpha\r\nbeta\ngamma".to_vec(); // "gamma" has no trailing newline
        let mut queue = BoundedLineQueue::new(16);
        let producer = queue.producer();
        let mut rx = queue.take_receiver();

        let source = LineSource::new(&data[..], producer);
        source.run().await;
        drop(queue);

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(String::from_utf8(line).unwrap());
        }
        // "gamma" (no trailing \n) must be discarded at EOF.
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn oversize_lines_are_split_and_counted() {
        let mut long = vec![b'x'; MAX_LINE_LEN * 2 + 10];
        long.push(b'\n');
        let mut queue = BoundedLineQueue::new(64);
        let producer = queue.producer();
        let mut rx = queue.take_receiver();

        let source = LineSource::new(&long[..], producer);
        let oversize = source.run().await;
        assert_eq!(oversize, 1);

        let mut total = 0usize;
        while let Ok(chunk) = rx.try_recv() {
            total += chunk.len();
        }
        assert_eq!(total, long.len() - 1);
    }

    #[tokio::test]
    async fn empty_stream_produces_no_lines() {
        let data: Vec<u8> = vec![];
        let mut queue = BoundedLineQueue::new(4);
        let producer = queue.producer();
        let mut rx = queue.take_receiver();
        let source = LineSource::new(&data[..], producer);
        source.run().await;
        assert!(rx.try_recv().is_err());
    }
}
