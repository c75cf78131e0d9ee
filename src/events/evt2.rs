//! Prophesee EVT 2.0 raw format.
//!
//! A file starts with `%`-prefixed ASCII header lines and continues with
//! little-endian 32-bit words. The top four bits give the word type.
//! TIME_HIGH words carry timestamp bits 33..6, event words the low six bits.

use std::io::BufRead;

use anyhow::{Context, Result};

use super::{CdEvent, EventBatch, TriggerEvent};

pub const CD_OFF: u32 = 0x0;
pub const CD_ON: u32 = 0x1;
pub const EVT_TIME_HIGH: u32 = 0x8;
pub const EXT_TRIGGER: u32 = 0xA;
pub const OTHERS: u32 = 0xE;
pub const CONTINUED: u32 = 0xF;

const TIME_LOW_BITS: u32 = 6;
const TIME_LOW_MASK: u64 = (1 << TIME_LOW_BITS) - 1;
const TIME_HIGH_MASK: u64 = 0x0FFF_FFFF;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evt2Header {
    pub width: u32,
    pub height: u32,
    pub lines: Vec<String>,
}

impl Default for Evt2Header {
    fn default() -> Self {
        Self { width: DEFAULT_WIDTH, height: DEFAULT_HEIGHT, lines: Vec::new() }
    }
}

impl Evt2Header {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, lines: Vec::new() }
    }

    fn apply(&mut self, line: &str) {
        let body = line.trim_start_matches('%').trim();
        if let Some(rest) = body.strip_prefix("format") {
            for field in rest.trim().split(';') {
                if let Some(v) = field.strip_prefix("width=") {
                    self.width = v.trim().parse().unwrap_or(self.width);
                } else if let Some(v) = field.strip_prefix("height=") {
                    self.height = v.trim().parse().unwrap_or(self.height);
                }
            }
        } else if let Some(rest) = body.strip_prefix("geometry") {
            if let Some((w, h)) = rest.trim().split_once('x') {
                self.width = w.trim().parse().unwrap_or(self.width);
                self.height = h.trim().parse().unwrap_or(self.height);
            }
        }
    }

    /// Read header lines, leaving the reader at the first event word.
    pub fn read<R: BufRead>(reader: &mut R) -> Result<Evt2Header> {
        let mut header = Evt2Header::default();
        loop {
            let next = reader.fill_buf().context("Failed to read EVT2 header")?;
            if next.first() != Some(&b'%') {
                break;
            }
            let mut raw = Vec::new();
            reader.read_until(b'\n', &mut raw).context("Failed to read EVT2 header")?;
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            let done = line.trim_start_matches('%').trim() == "end";
            header.apply(&line);
            header.lines.push(line);
            if done {
                break;
            }
        }
        Ok(header)
    }

    pub fn encode(&self) -> Vec<u8> {
        format!(
            "% evt 2.0\n% format EVT2;height={};width={}\n% geometry {}x{}\n% end\n",
            self.height, self.width, self.width, self.height
        )
        .into_bytes()
    }
}

/// Streaming word decoder. Bytes may be fed in arbitrary chunks.
#[derive(Debug, Default)]
pub struct Evt2Decoder {
    time_high: u64,
    partial: Vec<u8>,
}

impl Evt2Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8], out: &mut EventBatch) {
        let mut rest = bytes;
        if !self.partial.is_empty() {
            let need = 4 - self.partial.len();
            let take = need.min(rest.len());
            self.partial.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.partial.len() < 4 {
                return;
            }
            let word = u32::from_le_bytes([self.partial[0], self.partial[1], self.partial[2], self.partial[3]]);
            self.partial.clear();
            self.decode_word(word, out);
        }
        let mut chunks = rest.chunks_exact(4);
        for c in &mut chunks {
            self.decode_word(u32::from_le_bytes([c[0], c[1], c[2], c[3]]), out);
        }
        self.partial.extend_from_slice(chunks.remainder());
    }

    fn timestamp(&self, word: u32) -> u64 {
        (self.time_high << TIME_LOW_BITS) | ((word >> 22) as u64 & TIME_LOW_MASK)
    }

    pub fn decode_word(&mut self, word: u32, out: &mut EventBatch) {
        match word >> 28 {
            CD_OFF | CD_ON => out.cd.push(CdEvent {
                x: ((word >> 11) & 0x7FF) as u16,
                y: (word & 0x7FF) as u16,
                polarity: (word >> 28) as u8,
                t: self.timestamp(word),
            }),
            EVT_TIME_HIGH => self.time_high = word as u64 & TIME_HIGH_MASK,
            EXT_TRIGGER => out.triggers.push(TriggerEvent {
                t: self.timestamp(word),
                id: ((word >> 8) & 0x1F) as u8,
                polarity: (word & 1) as u8,
            }),
            _ => {}
        }
    }
}

/// Word encoder. Emits TIME_HIGH words whenever the high bits change.
#[derive(Debug, Default)]
pub struct Evt2Encoder {
    time_high: Option<u64>,
}

impl Evt2Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn sync_time(&mut self, t: u64, out: &mut Vec<u8>) {
        let high = (t >> TIME_LOW_BITS) & TIME_HIGH_MASK;
        if self.time_high != Some(high) {
            out.extend_from_slice(&((EVT_TIME_HIGH << 28) | high as u32).to_le_bytes());
            self.time_high = Some(high);
        }
    }

    pub fn encode_cd(&mut self, e: &CdEvent, out: &mut Vec<u8>) {
        self.sync_time(e.t, out);
        let kind = if e.polarity == 0 { CD_OFF } else { CD_ON };
        let word = (kind << 28)
            | (((e.t & TIME_LOW_MASK) as u32) << 22)
            | ((e.x as u32 & 0x7FF) << 11)
            | (e.y as u32 & 0x7FF);
        out.extend_from_slice(&word.to_le_bytes());
    }

    pub fn encode_trigger(&mut self, e: &TriggerEvent, out: &mut Vec<u8>) {
        self.sync_time(e.t, out);
        let word = (EXT_TRIGGER << 28)
            | (((e.t & TIME_LOW_MASK) as u32) << 22)
            | ((e.id as u32 & 0x1F) << 8)
            | (e.polarity as u32 & 1);
        out.extend_from_slice(&word.to_le_bytes());
    }

    /// Encode a batch with CD and trigger events merged by timestamp.
    pub fn encode_batch(&mut self, batch: &EventBatch, out: &mut Vec<u8>) {
        let mut cd = batch.cd.iter().peekable();
        let mut triggers = batch.triggers.iter().peekable();
        loop {
            match (cd.peek(), triggers.peek()) {
                (Some(c), Some(t)) if t.t < c.t => {
                    self.encode_trigger(t, out);
                    triggers.next();
                }
                (Some(c), _) => {
                    self.encode_cd(c, out);
                    cd.next();
                }
                (None, Some(t)) => {
                    self.encode_trigger(t, out);
                    triggers.next();
                }
                (None, None) => break,
            }
        }
    }
}
