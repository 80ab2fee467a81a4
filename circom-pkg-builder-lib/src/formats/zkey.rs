use super::FormatError;
use super::binfile::{BinFile, ByteReader};
use crate::types::{CircuitShape, Protocol};

pub const ZKEY_MAGIC: &[u8; 4] = b"zkey";
const HEADER_SECTION: u32 = 1;
const PROTOCOL_HEADER_SECTION: u32 = 2;
const GROTH16_COEFFS_SECTION: u32 = 4;

pub const GROTH16_TAG: u32 = 1;
pub const PLONK_TAG: u32 = 2;
pub const FFLONK_TAG: u32 = 10;

pub fn protocol_tag(protocol: Protocol) -> u32 {
    match protocol {
        Protocol::Groth16 => GROTH16_TAG,
        Protocol::Plonk => PLONK_TAG,
        Protocol::Fflonk => FFLONK_TAG,
    }
}

fn protocol_from_tag(tag: u32) -> Option<Protocol> {
    match tag {
        GROTH16_TAG => Some(Protocol::Groth16),
        PLONK_TAG => Some(Protocol::Plonk),
        FFLONK_TAG => Some(Protocol::Fflonk),
        _ => None,
    }
}

/// The fixed-layout prefix of a proving key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZkeyHeader {
    pub protocol: Protocol,
    /// Base field modulus, little-endian
    pub q: Vec<u8>,
    /// Scalar field modulus, little-endian
    pub r: Vec<u8>,
    pub n_vars: u32,
    pub n_public: u32,
    pub domain_size: u32,
    /// Only present for the universal-setup protocols
    pub n_additions: Option<u32>,
    /// groth16: r1cs constraints, recovered from the coefficient rows.
    /// plonk/fflonk: gate count from the header.
    pub n_constraints: Option<u32>,
}

pub fn read_header(bytes: &[u8]) -> Result<ZkeyHeader, FormatError> {
    let file = BinFile::parse(bytes, ZKEY_MAGIC)?;
    if file.version != 1 {
        return Err(FormatError::UnsupportedVersion(file.version));
    }

    let tag = ByteReader::new(file.require_section(HEADER_SECTION)?).read_u32("protocol")?;
    let protocol = protocol_from_tag(tag).ok_or_else(|| FormatError::InvalidValue {
        field: "protocol",
        detail: format!("unknown protocol tag {}", tag),
    })?;

    let mut reader = ByteReader::new(file.require_section(PROTOCOL_HEADER_SECTION)?);
    let q = reader.read_sized_bytes("q")?.to_vec();
    let r = reader.read_sized_bytes("r")?.to_vec();
    let n_vars = reader.read_u32("nVars")?;
    let n_public = reader.read_u32("nPublic")?;
    let domain_size = reader.read_u32("domainSize")?;
    let (n_additions, n_constraints) = match protocol {
        Protocol::Groth16 => {
            let coeffs = file.require_section(GROTH16_COEFFS_SECTION)?;
            (None, Some(groth16_constraint_count(coeffs, r.len(), n_public)?))
        }
        Protocol::Plonk | Protocol::Fflonk => (
            Some(reader.read_u32("nAdditions")?),
            Some(reader.read_u32("nConstraints")?),
        ),
    };

    if !domain_size.is_power_of_two() {
        return Err(FormatError::InvalidValue {
            field: "domainSize",
            detail: format!("{} is not a power of two", domain_size),
        });
    }

    Ok(ZkeyHeader {
        protocol,
        q,
        r,
        n_vars,
        n_public,
        domain_size,
        n_additions,
        n_constraints,
    })
}

/// The A-matrix rows of a groth16 key run past the r1cs constraints with one
/// row per public signal plus the constant, so the last row index is
/// `nConstraints + nPublic`.
fn groth16_constraint_count(section: &[u8], n8r: usize, n_public: u32) -> Result<u32, FormatError> {
    let mut reader = ByteReader::new(section);
    let n_coeffs = reader.read_u32("nCoeffs")?;
    let mut last_row: Option<u32> = None;
    for _ in 0..n_coeffs {
        let _matrix = reader.read_u32("coeff matrix")?;
        let row = reader.read_u32("coeff constraint")?;
        let _signal = reader.read_u32("coeff signal")?;
        reader.read_exact(n8r, "coeff value")?;
        last_row = Some(last_row.map_or(row, |last| last.max(row)));
    }
    last_row
        .and_then(|last| last.checked_sub(n_public))
        .ok_or_else(|| FormatError::InvalidValue {
            field: "coefficients",
            detail: format!("no rows for {} public signals", n_public),
        })
}

/// Domain a groth16 setup derives for a circuit: the smallest power of two
/// strictly above `nConstraints + nPublic`.
pub fn groth16_domain_size(shape: &CircuitShape) -> u64 {
    (shape.n_constraints as u64 + shape.n_public() as u64 + 1).next_power_of_two()
}

/// Checks that a proving key was made for `protocol` and for exactly this circuit.
pub fn check_consistency(
    header: &ZkeyHeader,
    protocol: Protocol,
    shape: &CircuitShape,
) -> Result<(), FormatError> {
    if header.protocol != protocol {
        return Err(mismatch("protocol", protocol, header.protocol));
    }
    if header.r != shape.prime {
        return Err(mismatch(
            "scalar field",
            hex::encode(&shape.prime),
            hex::encode(&header.r),
        ));
    }
    if header.n_public != shape.n_public() {
        return Err(mismatch("nPublic", shape.n_public(), header.n_public));
    }

    match protocol {
        Protocol::Groth16 => {
            if header.n_vars != shape.n_wires {
                return Err(mismatch("nVars", shape.n_wires, header.n_vars));
            }
            let expected_domain = groth16_domain_size(shape);
            if header.domain_size as u64 != expected_domain {
                return Err(mismatch("domainSize", expected_domain, header.domain_size));
            }
            let n_constraints = header.n_constraints.unwrap_or_default();
            if n_constraints != shape.n_constraints {
                return Err(mismatch("nConstraints", shape.n_constraints, n_constraints));
            }
        }
        Protocol::Plonk | Protocol::Fflonk => {
            let n_constraints = header.n_constraints.unwrap_or_default();
            // every r1cs constraint and every public input becomes at least one gate
            let min_gates = shape.n_constraints as u64 + shape.n_public() as u64;
            if (n_constraints as u64) < min_gates {
                return Err(mismatch("nConstraints", min_gates, n_constraints));
            }
            if n_constraints > header.domain_size {
                return Err(FormatError::InvalidValue {
                    field: "nConstraints",
                    detail: format!(
                        "{} gates do not fit domain {}",
                        n_constraints, header.domain_size
                    ),
                });
            }
        }
    }
    Ok(())
}

fn mismatch(
    field: &'static str,
    expected: impl std::fmt::Display,
    found: impl std::fmt::Display,
) -> FormatError {
    FormatError::Inconsistent {
        field,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::formats::r1cs::tests::{BN254_R, multiplier_shape};

    const BN254_Q: [u8; 32] = [
        0x47, 0xfd, 0x7c, 0xd8, 0x16, 0x8c, 0x20, 0x3c, 0x8d, 0xca, 0x71, 0x68, 0x91, 0x6a, 0x81,
        0x97, 0x5d, 0x58, 0x81, 0x81, 0xb6, 0x45, 0x50, 0xb8, 0x29, 0xa0, 0x31, 0xe1, 0x72, 0x4e,
        0x64, 0x30,
    ];

    /// Minimal zkey carrying only the header sections.
    pub(crate) fn encode_zkey(protocol: Protocol, shape: &CircuitShape) -> Vec<u8> {
        let domain = match protocol {
            Protocol::Groth16 => groth16_domain_size(shape) as u32,
            _ => ((shape.n_constraints + shape.n_public()) as u64).next_power_of_two() as u32,
        };
        let mut header = Vec::new();
        header.extend_from_slice(&32u32.to_le_bytes());
        header.extend_from_slice(&BN254_Q);
        header.extend_from_slice(&32u32.to_le_bytes());
        header.extend_from_slice(&BN254_R);
        header.extend_from_slice(&shape.n_wires.to_le_bytes());
        header.extend_from_slice(&shape.n_public().to_le_bytes());
        header.extend_from_slice(&domain.to_le_bytes());
        if protocol != Protocol::Groth16 {
            header.extend_from_slice(&0u32.to_le_bytes());
            header.extend_from_slice(&(shape.n_constraints + shape.n_public()).to_le_bytes());
        }

        let mut sections = vec![
            (HEADER_SECTION, protocol_tag(protocol).to_le_bytes().to_vec()),
            (PROTOCOL_HEADER_SECTION, header),
        ];
        if protocol == Protocol::Groth16 {
            sections.push((GROTH16_COEFFS_SECTION, encode_coeffs(shape)));
        }
        let mut out = ZKEY_MAGIC.to_vec();
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
        for (id, body) in &sections {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(body.len() as u64).to_le_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    /// One A-matrix entry per constraint, then the public-signal rows.
    pub(crate) fn encode_coeffs(shape: &CircuitShape) -> Vec<u8> {
        let rows = shape.n_constraints + shape.n_public() + 1;
        let mut out = rows.to_le_bytes().to_vec();
        for row in 0..rows {
            let signal = row.saturating_sub(shape.n_constraints);
            for v in [0, row, signal] {
                out.extend_from_slice(&v.to_le_bytes());
            }
            let mut value = [0u8; 32];
            value[0] = 1;
            out.extend_from_slice(&value);
        }
        out
    }

    #[test]
    fn accepts_matching_keys_for_every_protocol() {
        let shape = multiplier_shape();
        for protocol in Protocol::ALL {
            let header = read_header(&encode_zkey(protocol, &shape)).unwrap();
            assert_eq!(header.protocol, protocol);
            check_consistency(&header, protocol, &shape).unwrap();
        }
    }

    #[test]
    fn groth16_domain_for_multiplier() {
        // 1 constraint + 1 public + 1 -> 4
        assert_eq!(groth16_domain_size(&multiplier_shape()), 4);
    }

    #[test]
    fn rejects_foreign_protocol() {
        let shape = multiplier_shape();
        let header = read_header(&encode_zkey(Protocol::Plonk, &shape)).unwrap();
        assert!(matches!(
            check_consistency(&header, Protocol::Groth16, &shape),
            Err(FormatError::Inconsistent { field: "protocol", .. })
        ));
    }

    #[test]
    fn rejects_key_for_a_larger_circuit() {
        let shape = multiplier_shape();
        let mut other = shape.clone();
        other.n_constraints = 40;
        let header = read_header(&encode_zkey(Protocol::Groth16, &other)).unwrap();
        assert!(matches!(
            check_consistency(&header, Protocol::Groth16, &shape),
            Err(FormatError::Inconsistent { field: "domainSize", .. })
        ));
    }

    #[test]
    fn groth16_constraint_count_comes_from_coefficients() {
        let shape = multiplier_shape();
        let header = read_header(&encode_zkey(Protocol::Groth16, &shape)).unwrap();
        assert_eq!(header.n_constraints, Some(1));
    }

    #[test]
    fn rejects_key_one_constraint_off_within_the_same_domain() {
        let shape = multiplier_shape();
        let mut other = shape.clone();
        other.n_constraints = 2;
        assert_eq!(groth16_domain_size(&other), groth16_domain_size(&shape));
        let header = read_header(&encode_zkey(Protocol::Groth16, &other)).unwrap();
        assert!(matches!(
            check_consistency(&header, Protocol::Groth16, &shape),
            Err(FormatError::Inconsistent { field: "nConstraints", .. })
        ));
    }

    #[test]
    fn rejects_groth16_key_without_coefficients() {
        let bytes = encode_zkey(Protocol::Groth16, &multiplier_shape());
        let file = BinFile::parse(&bytes, ZKEY_MAGIC).unwrap();
        let mut stripped = ZKEY_MAGIC.to_vec();
        stripped.extend_from_slice(&1u32.to_le_bytes());
        stripped.extend_from_slice(&2u32.to_le_bytes());
        for id in [HEADER_SECTION, PROTOCOL_HEADER_SECTION] {
            let body = file.section(id).unwrap();
            stripped.extend_from_slice(&id.to_le_bytes());
            stripped.extend_from_slice(&(body.len() as u64).to_le_bytes());
            stripped.extend_from_slice(body);
        }
        assert!(matches!(
            read_header(&stripped),
            Err(FormatError::MissingSection(GROTH16_COEFFS_SECTION))
        ));
    }

    #[test]
    fn rejects_public_signal_mismatch() {
        let shape = multiplier_shape();
        let mut other = shape.clone();
        other.n_pub_in = 2;
        other.n_wires = 6;
        let header = read_header(&encode_zkey(Protocol::Groth16, &other)).unwrap();
        assert!(check_consistency(&header, Protocol::Groth16, &shape).is_err());
    }

    #[test]
    fn rejects_truncated_and_garbage_keys() {
        let bytes = encode_zkey(Protocol::Groth16, &multiplier_shape());
        assert!(read_header(&bytes[..bytes.len() / 2]).is_err());
        assert!(read_header(b"not a zkey at all").is_err());
        assert!(read_header(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_protocol_tag() {
        let mut bytes = encode_zkey(Protocol::Groth16, &multiplier_shape());
        // magic(4) + version(4) + nSections(4) + id(4) + len(8)
        bytes[24] = 7;
        assert!(matches!(
            read_header(&bytes),
            Err(FormatError::InvalidValue { field: "protocol", .. })
        ));
    }
}
