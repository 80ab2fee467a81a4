use super::FormatError;

/// Sectioned container shared by `.r1cs`, `.zkey` and `.ptau` files:
/// 4-byte magic, u32 version, u32 section count, then `(u32 id, u64 len, body)`
/// repeated. All integers little-endian.
#[derive(Debug)]
pub struct BinFile<'a> {
    pub magic: [u8; 4],
    pub version: u32,
    sections: Vec<(u32, &'a [u8])>,
}

impl<'a> BinFile<'a> {
    /// Parses the section table. Every declared section must fit in `bytes`.
    pub fn parse(bytes: &'a [u8], expected_magic: &[u8; 4]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_array::<4>("magic")?;
        if &magic != expected_magic {
            return Err(FormatError::BadMagic {
                expected: String::from_utf8_lossy(expected_magic).into_owned(),
                found: String::from_utf8_lossy(&magic).into_owned(),
            });
        }
        let version = reader.read_u32("version")?;
        let n_sections = reader.read_u32("n_sections")?;

        let mut sections = Vec::new();
        for _ in 0..n_sections {
            let id = reader.read_u32("section id")?;
            let len = reader.read_u64("section length")?;
            let len = usize::try_from(len).map_err(|_| FormatError::InvalidValue {
                field: "section length",
                detail: format!("{} does not fit in memory", len),
            })?;
            let body = reader.read_exact(len, "section body")?;
            sections.push((id, body));
        }

        Ok(Self {
            magic,
            version,
            sections,
        })
    }

    /// First section with the given id.
    pub fn section(&self, id: u32) -> Option<&'a [u8]> {
        self.sections
            .iter()
            .find(|(section_id, _)| *section_id == id)
            .map(|(_, body)| *body)
    }

    pub fn require_section(&self, id: u32) -> Result<&'a [u8], FormatError> {
        self.section(id).ok_or(FormatError::MissingSection(id))
    }
}

/// Bounds-checked cursor over a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub fn read_exact(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], FormatError> {
        if len > self.remaining() {
            return Err(FormatError::UnexpectedEnd {
                field,
                offset: self.offset,
            });
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], FormatError> {
        let bytes = self.read_exact(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.read_array::<4>(field)?))
    }

    pub fn read_u64(&mut self, field: &'static str) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.read_array::<8>(field)?))
    }

    /// Reads a `u32` byte width followed by that many bytes (a field element).
    pub fn read_sized_bytes(&mut self, field: &'static str) -> Result<&'a [u8], FormatError> {
        let width = self.read_u32(field)? as usize;
        if width == 0 || width > 64 {
            return Err(FormatError::InvalidValue {
                field,
                detail: format!("unsupported field width {}", width),
            });
        }
        self.read_exact(width, field)
    }
}
