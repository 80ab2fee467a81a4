//! Boundary to the proving library: trusted/universal setup reduction and the
//! exporters for verification keys and verifier contracts.

use crate::error::Result;
use crate::process;
use crate::types::Protocol;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Operations the pipeline needs from the proving library.
pub trait SnarkBackend: Send + Sync + fmt::Debug {
    /// Reduces a constraint system against a universal setup into a proving key.
    fn setup<'a>(
        &'a self,
        protocol: Protocol,
        r1cs: &'a Path,
        ptau: &'a Path,
        zkey_out: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;

    /// Adds one phase-2 contribution to a groth16 key.
    fn contribute<'a>(
        &'a self,
        zkey_in: &'a Path,
        zkey_out: &'a Path,
        entropy: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn export_verification_key<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;

    /// Renders the protocol's verifier contract template for this key.
    fn export_solidity_verifier<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Drives the `snarkjs` command line.
#[derive(Debug, Clone)]
pub struct SnarkjsCli {
    bin: PathBuf,
    timeout: Duration,
}

impl SnarkjsCli {
    pub fn new(bin: PathBuf, timeout: Duration) -> Self {
        Self { bin, timeout }
    }

    async fn run(&self, args: &[&std::ffi::OsStr]) -> Result<()> {
        let mut command = Command::new(&self.bin);
        command.args(args);
        process::check_success(process::run(command, self.timeout).await?)?;
        Ok(())
    }
}

impl SnarkBackend for SnarkjsCli {
    fn setup<'a>(
        &'a self,
        protocol: Protocol,
        r1cs: &'a Path,
        ptau: &'a Path,
        zkey_out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.run(&[
                protocol.as_str().as_ref(),
                "setup".as_ref(),
                r1cs.as_os_str(),
                ptau.as_os_str(),
                zkey_out.as_os_str(),
            ])
            .await
        }
        .boxed()
    }

    fn contribute<'a>(
        &'a self,
        zkey_in: &'a Path,
        zkey_out: &'a Path,
        entropy: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let entropy_arg = format!("-e={}", entropy);
            self.run(&[
                "zkey".as_ref(),
                "contribute".as_ref(),
                zkey_in.as_os_str(),
                zkey_out.as_os_str(),
                "--name=circom-pkg-builder".as_ref(),
                entropy_arg.as_ref(),
            ])
            .await
        }
        .boxed()
    }

    fn export_verification_key<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.run(&[
                "zkey".as_ref(),
                "export".as_ref(),
                "verificationkey".as_ref(),
                zkey.as_os_str(),
                out.as_os_str(),
            ])
            .await
        }
        .boxed()
    }

    fn export_solidity_verifier<'a>(
        &'a self,
        zkey: &'a Path,
        out: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            self.run(&[
                "zkey".as_ref(),
                "export".as_ref(),
                "solidityverifier".as_ref(),
                zkey.as_os_str(),
                out.as_os_str(),
            ])
            .await
        }
        .boxed()
    }
}

/// Universal setup files available on disk, keyed by power of two.
#[derive(Debug, Clone, Default)]
pub struct PtauCatalog {
    files: BTreeMap<u32, PathBuf>,
}

impl PtauCatalog {
    /// Collects `*_<power>.ptau` files. A missing directory is an empty catalog.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self { files }),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if let Some(power) = path.file_name().and_then(|n| n.to_str()).and_then(ptau_power) {
                files.insert(power, path);
            }
        }
        Ok(Self { files })
    }

    /// Smallest setup covering `2^power` points.
    pub fn select(&self, power: u32) -> Option<(u32, &Path)> {
        self.files
            .range(power..)
            .next()
            .map(|(p, path)| (*p, path.as_path()))
    }

    pub fn largest(&self) -> Option<u32> {
        self.files.keys().next_back().copied()
    }
}

fn ptau_power(file_name: &str) -> Option<u32> {
    file_name
        .strip_suffix(".ptau")?
        .rsplit('_')
        .next()?
        .parse()
        .ok()
}

/// Smallest `p` with `2^p >= points`.
pub fn ceil_log2(points: u64) -> u32 {
    points.max(1).next_power_of_two().trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ptau_powers() {
        assert_eq!(ptau_power("powersOfTau28_hez_final_12.ptau"), Some(12));
        assert_eq!(ptau_power("pot_8.ptau"), Some(8));
        assert_eq!(ptau_power("final.ptau"), None);
        assert_eq!(ptau_power("pot_8.zkey"), None);
    }

    #[test]
    fn selects_smallest_sufficient_setup() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["pot_8.ptau", "pot_12.ptau", "pot_16.ptau", "README"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let catalog = PtauCatalog::scan(dir.path()).unwrap();
        assert_eq!(catalog.select(2).map(|(p, _)| p), Some(8));
        assert_eq!(catalog.select(9).map(|(p, _)| p), Some(12));
        assert_eq!(catalog.select(17), None);
        assert_eq!(catalog.largest(), Some(16));
    }

    #[test]
    fn missing_ptau_dir_is_empty() {
        let catalog = PtauCatalog::scan(Path::new("/nonexistent/ptau")).unwrap();
        assert!(catalog.select(1).is_none());
    }

    #[test]
    fn ceil_log2_bounds() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
    }
}
