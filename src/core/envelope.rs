// Execution result envelope and its length-prefixed wire codec.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

/// Width of one fixed-size field on the wire.
pub const WORD_LEN: usize = size_of::<i64>();
/// Total length, exit code, user time, sys time, heap flag, error count.
pub const HEADER_WORDS: usize = 6;
pub const HEADER_LEN: usize = WORD_LEN * HEADER_WORDS;
pub const MAX_ENVELOPE_LEN: usize = 256 * 1024 * 1024;

/// One structured error reported by the recipe through the runtime's error state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub code: i64,
    pub line: i64,
    pub message: String,
    pub file: String,
    pub function: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProducedFrame {
    pub tag: String,
    pub filename: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Envelope {
    pub exit_code: i64,
    pub user_time_us: i64,
    pub sys_time_us: i64,
    /// `None` when the runtime could not tell whether all allocations were released.
    pub heap_balanced: Option<bool>,
    pub errors: Vec<ErrorRecord>,
    pub frames: Vec<ProducedFrame>,
}

impl Envelope {
    /// Fails with `Decode` when a string field holds an interior NUL, which the
    /// NUL-terminated wire strings cannot carry.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        write_word(&mut buf, 0);
        write_word(&mut buf, self.exit_code);
        write_word(&mut buf, self.user_time_us);
        write_word(&mut buf, self.sys_time_us);
        write_word(&mut buf, heap_flag_to_word(self.heap_balanced));
        write_word(&mut buf, self.errors.len() as i64);
        for error in &self.errors {
            write_word(&mut buf, error.code);
            write_word(&mut buf, error.line);
            write_str(&mut buf, &error.message)?;
            write_str(&mut buf, &error.file)?;
            write_str(&mut buf, &error.function)?;
        }
        for frame in &self.frames {
            write_str(&mut buf, &frame.tag)?;
            write_str(&mut buf, &frame.filename)?;
        }
        let total = buf.len() as i64;
        buf[..WORD_LEN].copy_from_slice(&total.to_ne_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut cursor = Cursor::new(buf);
        let total = cursor.word()?;
        if usize::try_from(total).ok() != Some(buf.len()) {
            return Err(Error::new(ErrorKind::Decode).with_message(format!(
                "declared length {total} does not match {} bytes",
                buf.len()
            )));
        }
        let exit_code = cursor.word()?;
        let user_time_us = cursor.word()?;
        let sys_time_us = cursor.word()?;
        let heap_balanced = heap_flag_from_word(cursor.word()?)?;
        let n_errors = cursor.word()?;
        if n_errors < 0 {
            return Err(Error::new(ErrorKind::Decode).with_message("negative error count"));
        }

        let mut errors = Vec::new();
        for _ in 0..n_errors {
            errors.push(ErrorRecord {
                code: cursor.word()?,
                line: cursor.word()?,
                message: cursor.string()?,
                file: cursor.string()?,
                function: cursor.string()?,
            });
        }

        let mut frames = Vec::new();
        while !cursor.is_empty() {
            let tag = cursor.string()?;
            if cursor.is_empty() {
                return Err(Error::new(ErrorKind::Decode)
                    .with_message("produced frame tag without filename"));
            }
            let filename = cursor.string()?;
            frames.push(ProducedFrame { tag, filename });
        }

        Ok(Self {
            exit_code,
            user_time_us,
            sys_time_us,
            heap_balanced,
            errors,
            frames,
        })
    }
}

/// Reads the declared total length from the first word of an envelope.
pub fn declared_len(header: &[u8; WORD_LEN]) -> i64 {
    i64::from_ne_bytes(*header)
}

fn heap_flag_to_word(flag: Option<bool>) -> i64 {
    match flag {
        None => -1,
        Some(false) => 0,
        Some(true) => 1,
    }
}

fn heap_flag_from_word(word: i64) -> Result<Option<bool>, Error> {
    match word {
        -1 => Ok(None),
        0 => Ok(Some(false)),
        1 => Ok(Some(true)),
        _ => Err(Error::new(ErrorKind::Decode).with_message("invalid heap flag")),
    }
}

fn write_word(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn write_str(buf: &mut Vec<u8>, value: &str) -> Result<(), Error> {
    if value.as_bytes().contains(&0) {
        return Err(Error::new(ErrorKind::Decode)
            .with_message(format!("string field {value:?} contains a NUL byte")));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.buf.len()
    }

    fn word(&mut self) -> Result<i64, Error> {
        let end = self.offset + WORD_LEN;
        let bytes = self
            .buf
            .get(self.offset..end)
            .ok_or_else(|| Error::new(ErrorKind::Decode).with_message("truncated word"))?;
        let mut word = [0u8; WORD_LEN];
        word.copy_from_slice(bytes);
        self.offset = end;
        Ok(i64::from_ne_bytes(word))
    }

    fn string(&mut self) -> Result<String, Error> {
        let rest = self.buf.get(self.offset..).unwrap_or_default();
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::new(ErrorKind::Decode).with_message("unterminated string"))?;
        let value = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.offset += len + 1;
        Ok(value)
    }
}
