//! Typed measurement payloads and their 4-byte wire tags.

/// Datatype tag carried in the LVBANK header, 4 ASCII bytes NUL-padded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Double,
    Float,
    Int32,
    UInt32,
    Text,
    Bytes,
    /// Unassigned. Parsed for completeness; the client never emits it.
    Null,
}

impl DataType {
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            DataType::Double => b"DBL\0",
            DataType::Float => b"FLT\0",
            DataType::Int32 => b"I32\0",
            DataType::UInt32 => b"U32\0",
            DataType::Text => b"STR\0",
            DataType::Bytes => b"U8\0\0",
            DataType::Null => b"NULL",
        }
    }

    pub fn from_tag(tag: &[u8; 4]) -> Option<Self> {
        match tag {
            b"DBL\0" => Some(DataType::Double),
            b"FLT\0" => Some(DataType::Float),
            b"I32\0" => Some(DataType::Int32),
            b"U32\0" => Some(DataType::UInt32),
            b"STR\0" => Some(DataType::Text),
            b"U8\0\0" => Some(DataType::Bytes),
            b"NULL" => Some(DataType::Null),
            _ => None,
        }
    }
}

/// A submitted measurement value. The variant fixes the wire tag, so
/// unsupported payload shapes cannot reach the packer at all.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Double(Vec<f64>),
    Float(Vec<f32>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Double(_) => DataType::Double,
            Payload::Float(_) => DataType::Float,
            Payload::Int32(_) => DataType::Int32,
            Payload::UInt32(_) => DataType::UInt32,
            Payload::Text(_) => DataType::Text,
            Payload::Bytes(_) => DataType::Bytes,
        }
    }

    /// Contiguous little-endian encoding. `Text` gains its trailing NUL
    /// here.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Double(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Payload::Float(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Payload::Int32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Payload::UInt32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Payload::Text(text) => {
                let mut out = Vec::with_capacity(text.len() + 1);
                out.extend_from_slice(text.as_bytes());
                out.push(0);
                out
            }
            Payload::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl From<Vec<f64>> for Payload {
    fn from(values: Vec<f64>) -> Self {
        Payload::Double(values)
    }
}

impl From<&[f64]> for Payload {
    fn from(values: &[f64]) -> Self {
        Payload::Double(values.to_vec())
    }
}

impl From<Vec<f32>> for Payload {
    fn from(values: Vec<f32>) -> Self {
        Payload::Float(values)
    }
}

impl From<Vec<i32>> for Payload {
    fn from(values: Vec<i32>) -> Self {
        Payload::Int32(values)
    }
}

impl From<Vec<u32>> for Payload {
    fn from(values: Vec<u32>) -> Self {
        Payload::UInt32(values)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_tags_round_trip() {
        for data_type in [
            DataType::Double,
            DataType::Float,
            DataType::Int32,
            DataType::UInt32,
            DataType::Text,
            DataType::Bytes,
            DataType::Null,
        ] {
            assert_eq!(DataType::from_tag(data_type.tag()), Some(data_type));
        }
        assert_eq!(DataType::from_tag(b"XYZ\0"), None);
    }

    #[test]
    fn test_double_encoding() {
        let payload = Payload::from(vec![1.0_f64, 2.0]);
        let bytes = payload.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..8], &1.0_f64.to_le_bytes());
        assert_eq!(&bytes[8..], &2.0_f64.to_le_bytes());
    }

    #[test]
    fn test_text_gets_trailing_nul() {
        let payload = Payload::from("hello");
        assert_eq!(payload.data_type(), DataType::Text);
        assert_eq!(payload.to_bytes(), b"hello\0");
    }

    #[test]
    fn test_from_impls_pick_the_tag() {
        assert_matches!(Payload::from(vec![0_i32]), Payload::Int32(_));
        assert_matches!(Payload::from(vec![0_u32]), Payload::UInt32(_));
        assert_matches!(Payload::from(vec![0_u8]), Payload::Bytes(_));
        assert_matches!(Payload::from(&[0.5_f64][..]), Payload::Double(_));
        assert_eq!(Payload::from(vec![7_u8, 8]).to_bytes(), vec![7, 8]);
    }
}
