use super::FormatError;
use super::binfile::{BinFile, ByteReader};
use crate::types::CircuitShape;

pub const R1CS_MAGIC: &[u8; 4] = b"r1cs";
pub const R1CS_VERSION: u32 = 1;
const HEADER_SECTION: u32 = 1;

/// Reads the header section of a compiled constraint system.
pub fn read_shape(bytes: &[u8]) -> Result<CircuitShape, FormatError> {
    let file = BinFile::parse(bytes, R1CS_MAGIC)?;
    if file.version != R1CS_VERSION {
        return Err(FormatError::UnsupportedVersion(file.version));
    }
    let mut header = ByteReader::new(file.require_section(HEADER_SECTION)?);

    let prime = header.read_sized_bytes("prime")?.to_vec();
    let shape = CircuitShape {
        prime,
        n_wires: header.read_u32("nWires")?,
        n_pub_out: header.read_u32("nPubOut")?,
        n_pub_in: header.read_u32("nPubIn")?,
        n_prv_in: header.read_u32("nPrvIn")?,
        n_labels: header.read_u64("nLabels")?,
        n_constraints: header.read_u32("nConstraints")?,
    };

    // wire 0 is the constant one
    let io = 1u64 + shape.n_pub_out as u64 + shape.n_pub_in as u64 + shape.n_prv_in as u64;
    if io > shape.n_wires as u64 {
        return Err(FormatError::InvalidValue {
            field: "nWires",
            detail: format!("{} wires cannot hold {} io signals", shape.n_wires, io),
        });
    }
    Ok(shape)
}
