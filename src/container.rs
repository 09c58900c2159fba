use crate::error::{Error, Result};
use flate2::{Decompress, FlushDecompress, Status};
use winnow::binary::le_u32;
use winnow::error::ContextError;
use winnow::Parser;

pub const RPYC2_HEADER: &[u8] = b"RENPY RPC2";

/// Statements the engine runs.
pub const SLOT_STATEMENTS: u32 = 1;
/// Statements as they were before the compiler's translation pass.
pub const SLOT_PRE_TRANSLATION: u32 = 2;

pub const DEFAULT_SLOTS: [u32; 2] = [SLOT_STATEMENTS, SLOT_PRE_TRANSLATION];
pub const PRE_TRANSLATED_SLOTS: [u32; 2] = [SLOT_PRE_TRANSLATION, SLOT_STATEMENTS];

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub slot: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// The whole file is one compressed blob, implicitly slot 1.
    Legacy,
    MultiSlot(Vec<SlotEntry>),
}

#[derive(Debug)]
pub struct Container<'a> {
    bytes: &'a [u8],
    framing: Framing,
}

impl<'a> Container<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let framing = match bytes.strip_prefix(RPYC2_HEADER) {
            Some(rest) => Framing::MultiSlot(read_directory(rest, bytes.len())?),
            None => Framing::Legacy,
        };
        Ok(Self { bytes, framing })
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn slots(&self) -> Vec<u32> {
        match &self.framing {
            Framing::Legacy => vec![SLOT_STATEMENTS],
            Framing::MultiSlot(entries) => entries.iter().map(|e| e.slot).collect(),
        }
    }

    /// Raw, still-compressed bytes of `slot`, if present.
    pub fn raw_slot(&self, slot: u32) -> Option<&'a [u8]> {
        match &self.framing {
            Framing::Legacy => (slot == SLOT_STATEMENTS).then_some(self.bytes),
            Framing::MultiSlot(entries) => entries.iter().find(|e| e.slot == slot).map(|e| {
                let start = e.offset as usize;
                &self.bytes[start..start + e.length as usize]
            }),
        }
    }

    pub fn read_slot(&self, preferred: &[u32]) -> Result<DecompressedPayload> {
        for &slot in preferred {
            if let Some(raw) = self.raw_slot(slot) {
                tracing::debug!(slot, compressed = raw.len(), "reading container slot");
                let data = inflate(raw)?;
                return Ok(DecompressedPayload { slot, data });
            }
        }
        let what = match self.framing {
            Framing::Legacy => "legacy file without signature only has slot 1".to_string(),
            Framing::MultiSlot(_) => format!("available slots are {:?}", self.slots()),
        };
        Err(Error::Format(format!(
            "none of the requested slots {:?} found; {}",
            preferred, what
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompressedPayload {
    pub slot: u32,
    pub data: Vec<u8>,
}

pub fn read_slot(bytes: &[u8], preferred: &[u32]) -> Result<DecompressedPayload> {
    Container::parse(bytes)?.read_slot(preferred)
}

fn read_directory(mut input: &[u8], file_len: usize) -> Result<Vec<SlotEntry>> {
    let mut entries = Vec::new();
    loop {
        let at = file_len - input.len();
        let (slot, offset, length) = (le_u32, le_u32, le_u32)
            .parse_next(&mut input)
            .map_err(|_: ContextError| {
                Error::Format(format!("slot directory truncated at byte {}", at))
            })?;
        if slot == 0 {
            break;
        }
        let end = offset as u64 + length as u64;
        if end > file_len as u64 {
            return Err(Error::Format(format!(
                "slot {} spans bytes {}..{} beyond file length {}",
                slot, offset, end, file_len
            )));
        }
        entries.push(SlotEntry {
            slot,
            offset,
            length,
        });
    }
    Ok(entries)
}

/// Inflates one zlib stream, which must end exactly at the end of `data`.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = Decompress::new(true);
    let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(CHUNK * 16));
    loop {
        if out.len() == out.capacity() {
            out.reserve(CHUNK);
        }
        let before = (decoder.total_in(), decoder.total_out());
        let consumed = decoder.total_in() as usize;
        let status = decoder
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| Error::Decompression(e.to_string()))?;
        match status {
            Status::StreamEnd => break,
            _ if (decoder.total_in(), decoder.total_out()) == before => {
                return Err(Error::Decompression(format!(
                    "compressed stream truncated after {} of {} bytes",
                    decoder.total_in(),
                    data.len()
                )));
            }
            _ => {}
        }
    }
    let consumed = decoder.total_in() as usize;
    if consumed != data.len() {
        return Err(Error::Decompression(format!(
            "{} trailing bytes after compressed stream",
            data.len() - consumed
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{multi_slot, zlib};

    #[test]
    fn test_legacy_is_slot_one() {
        let file = zlib(b"payload");
        let payload = read_slot(&file, &DEFAULT_SLOTS).unwrap();
        assert_eq!(payload.slot, 1);
        assert_eq!(payload.data, b"payload");
    }

    #[test]
    fn test_legacy_without_slot_one_requested() {
        let file = zlib(b"payload");
        let err = read_slot(&file, &[2]).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err:?}");
    }

    #[test]
    fn test_slot_selection() {
        let file = multi_slot(&[(1, b"AAAA".as_slice()), (2, b"BB".as_slice())]);
        assert_eq!(read_slot(&file, &[2]).unwrap().data, b"BB");
        assert_eq!(read_slot(&file, &DEFAULT_SLOTS).unwrap().data, b"AAAA");
        assert_eq!(read_slot(&file, &PRE_TRANSLATED_SLOTS).unwrap().data, b"BB");

        let err = read_slot(&file, &[3]).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err:?}");
    }

    #[test]
    fn test_lists_slots() {
        let file = multi_slot(&[(1, b"x".as_slice()), (2, b"y".as_slice())]);
        let container = Container::parse(&file).unwrap();
        assert_eq!(container.slots(), vec![1, 2]);
    }

    #[test]
    fn test_truncated_directory() {
        let mut file = RPYC2_HEADER.to_vec();
        file.extend_from_slice(&1u32.to_le_bytes());
        file.extend_from_slice(&3u32.to_le_bytes());
        let err = Container::parse(&file).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err:?}");
    }

    #[test]
    fn test_slot_out_of_range() {
        let mut file = RPYC2_HEADER.to_vec();
        for v in [1u32, 100, 50, 0, 0, 0] {
            file.extend_from_slice(&v.to_le_bytes());
        }
        let err = Container::parse(&file).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err:?}");
    }

    #[test]
    fn test_truncated_stream() {
        let blob = zlib(b"a longer payload that compresses into several bytes");
        let cut = &blob[..blob.len() - 6];
        let err = inflate(cut).unwrap_err();
        assert!(matches!(err, Error::Decompression(_)), "{err:?}");
    }

    #[test]
    fn test_trailing_garbage() {
        let mut blob = zlib(b"payload");
        blob.extend_from_slice(b"junk");
        let err = inflate(&blob).unwrap_err();
        assert!(matches!(err, Error::Decompression(_)), "{err:?}");
    }

    #[test]
    fn test_not_zlib() {
        let err = read_slot(b"definitely not compressed", &DEFAULT_SLOTS).unwrap_err();
        assert!(matches!(err, Error::Decompression(_)), "{err:?}");
    }
}
