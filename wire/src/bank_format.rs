//! LVBANK and GEA1 superbank framing.

use {
    crate::{
        payload::DataType,
        timestamp::{LvTimestamp, LV_TIMESTAMP_LEN},
    },
    static_assertions::const_assert_eq,
    thiserror::Error,
};

pub const BANK_TAG: &[u8; 4] = b"GEB1";
pub const SUPERBANK_TAG: &[u8; 4] = b"GEA1";

pub const CATEGORY_LEN: usize = 16;
pub const VARNAME_LEN: usize = 16;
pub const DESCRIPTION_LEN: usize = 32;

pub const BANK_HEADER_LEN: usize = 88;
pub const SUPERBANK_HEADER_LEN: usize = 16;

// tag + datatype + three strings + four i16 + two i32
const_assert_eq!(
    BANK_HEADER_LEN,
    4 + 4 + CATEGORY_LEN + VARNAME_LEN + DESCRIPTION_LEN + 4 * 2 + 2 * 4
);

/// Byte-order code carried in the LVBANK header: 2 little-endian, 1 big.
pub fn host_byte_order() -> i16 {
    if cfg!(target_endian = "little") {
        2
    } else {
        1
    }
}

/// Truncate to at most `N` bytes on a char boundary and right-pad with NUL.
pub fn pad_fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut len = s.len().min(N);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad bank tag {0:?}")]
    BadBankTag([u8; 4]),
    #[error("bad superbank tag {0:?}")]
    BadSuperBankTag([u8; 4]),
    #[error("unknown datatype tag {0:?}")]
    UnknownDataType([u8; 4]),
    #[error("payload length mismatch: header says {expected}, have {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

fn take<'a>(bytes: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    if bytes.len() < len {
        return Err(WireError::Truncated {
            need: len,
            have: bytes.len(),
        });
    }
    let (head, rest) = bytes.split_at(len);
    *bytes = rest;
    Ok(head)
}

fn take_array<const N: usize>(bytes: &mut &[u8]) -> Result<[u8; N], WireError> {
    Ok(take(bytes, N)?.try_into().unwrap())
}

/// The fixed 88-byte header in front of every LVBANK record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BankHeader {
    pub data_type: DataType,
    pub category: [u8; CATEGORY_LEN],
    pub varname: [u8; VARNAME_LEN],
    pub description: [u8; DESCRIPTION_LEN],
    pub history_settings: i16,
    pub history_rate: i16,
    pub timestamp_byte_order: i16,
    pub data_byte_order: i16,
    pub block_size: i32,
    pub num_blocks: i32,
}

impl BankHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(BANK_TAG);
        out.extend_from_slice(self.data_type.tag());
        out.extend_from_slice(&self.category);
        out.extend_from_slice(&self.varname);
        out.extend_from_slice(&self.description);
        out.extend_from_slice(&self.history_settings.to_le_bytes());
        out.extend_from_slice(&self.history_rate.to_le_bytes());
        out.extend_from_slice(&self.timestamp_byte_order.to_le_bytes());
        out.extend_from_slice(&self.data_byte_order.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.num_blocks.to_le_bytes());
    }

    pub fn parse(bytes: &mut &[u8]) -> Result<Self, WireError> {
        let tag: [u8; 4] = take_array(bytes)?;
        if &tag != BANK_TAG {
            return Err(WireError::BadBankTag(tag));
        }
        let datatype_tag: [u8; 4] = take_array(bytes)?;
        let data_type =
            DataType::from_tag(&datatype_tag).ok_or(WireError::UnknownDataType(datatype_tag))?;
        Ok(Self {
            data_type,
            category: take_array(bytes)?,
            varname: take_array(bytes)?,
            description: take_array(bytes)?,
            history_settings: i16::from_le_bytes(take_array(bytes)?),
            history_rate: i16::from_le_bytes(take_array(bytes)?),
            timestamp_byte_order: i16::from_le_bytes(take_array(bytes)?),
            data_byte_order: i16::from_le_bytes(take_array(bytes)?),
            block_size: i32::from_le_bytes(take_array(bytes)?),
            num_blocks: i32::from_le_bytes(take_array(bytes)?),
        })
    }
}

/// One parsed LVBANK: its header and raw LVDATA payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedBank<'a> {
    pub header: BankHeader,
    pub payload: &'a [u8],
}

impl<'a> ParsedBank<'a> {
    /// Parse one LVBANK from the front of `bytes`, leaving the remainder.
    pub fn parse_prefix(bytes: &mut &'a [u8]) -> Result<Self, WireError> {
        let header = BankHeader::parse(bytes)?;
        let payload_len = (header.block_size.max(0) as usize) * (header.num_blocks.max(0) as usize);
        let payload = take(bytes, payload_len)?;
        Ok(Self { header, payload })
    }

    /// Parse a buffer holding exactly one LVBANK.
    pub fn parse(mut bytes: &'a [u8]) -> Result<Self, WireError> {
        let total = bytes.len();
        let bank = Self::parse_prefix(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(WireError::LengthMismatch {
                expected: total - bytes.len(),
                actual: total,
            });
        }
        Ok(bank)
    }

    /// The LVDATA records: (timestamp, data) per block.
    pub fn blocks(&self) -> impl Iterator<Item = (LvTimestamp, &'a [u8])> {
        let block_size = (self.header.block_size.max(0) as usize).max(LV_TIMESTAMP_LEN);
        self.payload.chunks_exact(block_size).map(|block| {
            let timestamp = LvTimestamp::from_le_bytes(block[..LV_TIMESTAMP_LEN].try_into().unwrap());
            (timestamp, &block[LV_TIMESTAMP_LEN..])
        })
    }
}

/// The fixed 16-byte header in front of a GEA1 superbank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SuperBankHeader {
    pub array_id: u32,
    pub payload_len: u32,
    pub bank_count: u32,
}

impl SuperBankHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(SUPERBANK_TAG);
        out.extend_from_slice(&self.array_id.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&self.bank_count.to_le_bytes());
    }

    pub fn parse(bytes: &mut &[u8]) -> Result<Self, WireError> {
        let tag: [u8; 4] = take_array(bytes)?;
        if &tag != SUPERBANK_TAG {
            return Err(WireError::BadSuperBankTag(tag));
        }
        Ok(Self {
            array_id: u32::from_le_bytes(take_array(bytes)?),
            payload_len: u32::from_le_bytes(take_array(bytes)?),
            bank_count: u32::from_le_bytes(take_array(bytes)?),
        })
    }
}

/// Split a GEA1 superbank into its header and contained LVBANKs.
pub fn parse_superbank(mut bytes: &[u8]) -> Result<(SuperBankHeader, Vec<ParsedBank<'_>>), WireError> {
    let header = SuperBankHeader::parse(&mut bytes)?;
    if bytes.len() != header.payload_len as usize {
        return Err(WireError::LengthMismatch {
            expected: header.payload_len as usize,
            actual: bytes.len(),
        });
    }
    let mut banks = Vec::with_capacity(header.bank_count as usize);
    for _ in 0..header.bank_count {
        banks.push(ParsedBank::parse_prefix(&mut bytes)?);
    }
    if !bytes.is_empty() {
        return Err(WireError::LengthMismatch {
            expected: header.payload_len as usize - bytes.len(),
            actual: header.payload_len as usize,
        });
    }
    Ok((header, banks))
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn sample_header(num_blocks: i32) -> BankHeader {
        BankHeader {
            data_type: DataType::Double,
            category: pad_fixed("CatchingTrap"),
            varname: pad_fixed("Pressure"),
            description: pad_fixed("simulated"),
            history_settings: 0,
            history_rate: 1,
            timestamp_byte_order: host_byte_order(),
            data_byte_order: host_byte_order(),
            block_size: 24,
            num_blocks,
        }
    }

    #[test]
    fn test_pad_fixed_truncates_and_pads() {
        let padded: [u8; 4] = pad_fixed("abcdef");
        assert_eq!(&padded, b"abcd");
        let padded: [u8; 8] = pad_fixed("ab");
        assert_eq!(&padded, b"ab\0\0\0\0\0\0");
        // multi-byte char straddling the cut is dropped whole
        let padded: [u8; 3] = pad_fixed("aé");
        assert_eq!(&padded, b"a\xc3\xa9");
        let padded: [u8; 2] = pad_fixed("aé");
        assert_eq!(&padded, b"a\0");
    }

    #[test]
    fn test_host_byte_order_code() {
        let expected = if cfg!(target_endian = "little") { 2 } else { 1 };
        assert_eq!(host_byte_order(), expected);
    }

    #[test]
    fn test_bank_header_round_trip() {
        let header = sample_header(3);
        let mut encoded = Vec::new();
        header.encode_into(&mut encoded);
        assert_eq!(encoded.len(), BANK_HEADER_LEN);
        assert_eq!(&encoded[..4], BANK_TAG);
        assert_eq!(&encoded[4..8], b"DBL\0");

        let mut slice = &encoded[..];
        assert_eq!(BankHeader::parse(&mut slice).unwrap(), header);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_parse_rejects_bad_tags() {
        let mut encoded = Vec::new();
        sample_header(1).encode_into(&mut encoded);
        encoded[0] = b'X';
        assert_matches!(
            BankHeader::parse(&mut &encoded[..]),
            Err(WireError::BadBankTag(_))
        );

        let mut encoded = Vec::new();
        sample_header(1).encode_into(&mut encoded);
        encoded[4..8].copy_from_slice(b"????");
        assert_matches!(
            BankHeader::parse(&mut &encoded[..]),
            Err(WireError::UnknownDataType(_))
        );
    }

    #[test]
    fn test_parse_truncated_buffer() {
        let mut encoded = Vec::new();
        sample_header(1).encode_into(&mut encoded);
        assert_matches!(
            BankHeader::parse(&mut &encoded[..40]),
            Err(WireError::Truncated { .. })
        );
    }

    #[test]
    fn test_superbank_round_trip() {
        let mut bank_bytes = Vec::new();
        sample_header(1).encode_into(&mut bank_bytes);
        let timestamp = LvTimestamp::from_unix_parts(1_600_000_000, 0);
        bank_bytes.extend_from_slice(&timestamp.to_le_bytes());
        bank_bytes.extend_from_slice(&42.0_f64.to_le_bytes());

        let mut packet = Vec::new();
        SuperBankHeader {
            array_id: 9,
            payload_len: (2 * bank_bytes.len()) as u32,
            bank_count: 2,
        }
        .encode_into(&mut packet);
        packet.extend_from_slice(&bank_bytes);
        packet.extend_from_slice(&bank_bytes);

        let (header, banks) = parse_superbank(&packet).unwrap();
        assert_eq!(header.array_id, 9);
        assert_eq!(banks.len(), 2);
        let blocks: Vec<_> = banks[0].blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, timestamp);
        assert_eq!(blocks[0].1, &42.0_f64.to_le_bytes());
    }

    #[test]
    fn test_superbank_length_mismatch() {
        let mut packet = Vec::new();
        SuperBankHeader {
            array_id: 0,
            payload_len: 100,
            bank_count: 1,
        }
        .encode_into(&mut packet);
        assert_matches!(
            parse_superbank(&packet),
            Err(WireError::LengthMismatch { .. })
        );
    }
}
