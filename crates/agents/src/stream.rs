use serde_json::Value;

/// Incremental scanner for line-delimited JSON agent output.
///
/// Characters are buffered until a prefix parses as a complete JSON value,
/// which is then emitted and the buffer reset. Non-JSON noise lines (agent
/// banners, progress spinners) are dropped at the next newline.
#[derive(Debug, Default)]
pub struct JsonStream {
    buf: String,
}

impl JsonStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every complete JSON object it closes.
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let trimmed_start = self.buf.len() - self.buf.trim_start().len();
            if trimmed_start > 0 {
                self.buf.drain(..trimmed_start);
            }
            if self.buf.is_empty() {
                break;
            }

            let mut iter = serde_json::Deserializer::from_str(&self.buf).into_iter::<Value>();
            match iter.next() {
                Some(Ok(value)) => {
                    let consumed = iter.byte_offset();
                    self.buf.drain(..consumed);
                    out.push(value);
                }
                Some(Err(e)) if e.is_eof() => break,
                _ => {
                    // Garbage prefix: drop through the next newline and retry.
                    match self.buf.find('\n') {
                        Some(pos) => {
                            self.buf.drain(..=pos);
                        }
                        None => {
                            self.buf.clear();
                            break;
                        }
                    }
                }
            }
        }

        out
    }
}
