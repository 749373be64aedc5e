//! Checksum commands - digest, trailer verification and image signing

use std::path::Path;

use anyhow::{bail, Context, Result};
use ecuprog_core::checksum::{self, ChecksumAlgorithm};
use serde::Serialize;

use crate::output::OutputContext;

#[derive(Debug, Serialize)]
struct Digest {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

#[derive(Debug, Serialize)]
struct ChecksumReport {
    file: String,
    size: usize,
    digests: Vec<Digest>,
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    file: String,
    algorithm: ChecksumAlgorithm,
    valid: bool,
    expected: String,
    actual: String,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))
}

/// Print the digest of a whole file, for one algorithm or all of them
pub fn checksum(
    file_path: &Path,
    algorithm: Option<ChecksumAlgorithm>,
    ctx: &OutputContext,
) -> Result<()> {
    let data = read_image(file_path)?;
    let algorithms = match algorithm {
        Some(algorithm) => vec![algorithm],
        None => ChecksumAlgorithm::ALL.to_vec(),
    };

    let digests: Vec<Digest> = algorithms
        .into_iter()
        .map(|algorithm| Digest {
            algorithm,
            digest: hex::encode_upper(checksum::calculate_checksum(&data, algorithm)),
        })
        .collect();

    let mut pairs = vec![("size", format!("{} bytes", data.len()))];
    pairs.extend(digests.iter().map(|d| (d.algorithm.name(), d.digest.clone())));

    let report = ChecksumReport {
        file: file_path.display().to_string(),
        size: data.len(),
        digests,
    };
    ctx.print_kv(&pairs, &report);
    Ok(())
}

/// Check that the file ends with a valid checksum trailer
pub fn verify(file_path: &Path, algorithm: ChecksumAlgorithm, ctx: &OutputContext) -> Result<()> {
    let data = read_image(file_path)?;
    let trailer = algorithm.trailer_size();
    if data.len() < trailer {
        bail!(
            "Image is {} bytes, shorter than the {}-byte {} trailer",
            data.len(),
            trailer,
            algorithm
        );
    }

    let (payload, stored) = data.split_at(data.len() - trailer);
    let report = VerifyReport {
        file: file_path.display().to_string(),
        algorithm,
        valid: checksum::verify(&data, algorithm),
        expected: hex::encode_upper(checksum::calculate_checksum(payload, algorithm)),
        actual: hex::encode_upper(stored),
    };

    ctx.print_kv(
        &[
            ("algorithm", algorithm.to_string()),
            ("computed", report.expected.clone()),
            ("trailer", report.actual.clone()),
        ],
        &report,
    );

    if !report.valid {
        bail!(
            "Checksum mismatch: trailer {} but payload computes to {}",
            report.actual,
            report.expected
        );
    }
    ctx.success("Checksum OK");
    Ok(())
}

/// Append a checksum trailer to `input`, writing the signed image to `output`
pub fn sign(
    input: &Path,
    output: &Path,
    algorithm: ChecksumAlgorithm,
    ctx: &OutputContext,
) -> Result<()> {
    let payload = read_image(input)?;
    let signed = checksum::append_checksum(&payload, algorithm);
    std::fs::write(output, &signed)
        .with_context(|| format!("Failed to write signed image: {}", output.display()))?;

    let trailer = hex::encode_upper(&signed[payload.len()..]);
    ctx.success(&format!(
        "Signed {} ({} bytes) with {} trailer {}",
        output.display(),
        signed.len(),
        algorithm,
        trailer
    ));
    Ok(())
}
