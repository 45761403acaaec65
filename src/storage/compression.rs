/// Gzip compression of partition files
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{write_atomic, CompressionSummary};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Read a file, decompressing it when its contents are gzip
pub fn read_maybe_compressed(path: &Path) -> std::io::Result<Vec<u8>> {
    let bytes = std::fs::read(path)?;
    if is_gzip(&bytes) {
        gunzip(&bytes)
    } else {
        Ok(bytes)
    }
}

/// Path of the compressed twin of an uncompressed file
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Compress one file into its `.gz` twin and remove the original
fn compress_file(path: &Path) -> std::io::Result<PathBuf> {
    let dest = compressed_path(path);
    let input = std::fs::read(path)?;
    write_atomic(&dest, &gzip(&input)?)?;
    std::fs::remove_file(path)?;
    Ok(dest)
}

/// Compress every uncompressed reading file in a partition directory.
///
/// Files already compressed are skipped. A failure on one file is logged and
/// the remaining files are still processed; a leftover original next to its
/// twin is compressed again on the next pass.
pub fn compress_partition_dir(dir: &Path) -> std::io::Result<CompressionSummary> {
    let mut summary = CompressionSummary::default();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !file_name.starts_with("readings_") {
            continue;
        }

        if file_name.ends_with(".json.gz") {
            summary.skipped += 1;
        } else if file_name.ends_with(".json") {
            match compress_file(&path) {
                Ok(dest) => {
                    debug!("Compressed {} -> {}", path.display(), dest.display());
                    summary.compressed += 1;
                }
                Err(e) => {
                    warn!("Failed to compress {}: {}", path.display(), e);
                    summary.failed += 1;
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gzip_round_trip() {
        let data = br#"[{"temperature":22.5}]"#;
        let compressed = gzip(data).unwrap();
        assert!(is_gzip(&compressed));
        assert!(!is_gzip(data));
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }

    #[test]
    fn test_compress_partition_dir() {
        let dir = tempdir().unwrap();
        let partition = dir.path();
        std::fs::write(partition.join("readings_aabbccddeeff.json"), "[]").unwrap();
        std::fs::write(partition.join("readings_112233445566.json"), "[1]").unwrap();
        std::fs::write(partition.join("notes.txt"), "leave me").unwrap();

        let summary = compress_partition_dir(partition).unwrap();
        assert_eq!(summary.compressed, 2);
        assert_eq!(summary.failed, 0);
        assert!(!partition.join("readings_aabbccddeeff.json").exists());
        assert!(partition.join("readings_aabbccddeeff.json.gz").exists());
        assert!(partition.join("notes.txt").exists());

        let restored =
            read_maybe_compressed(&partition.join("readings_112233445566.json.gz")).unwrap();
        assert_eq!(restored, b"[1]");

        // Second pass is a no-op
        let summary = compress_partition_dir(partition).unwrap();
        assert_eq!(summary.compressed, 0);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn test_one_failing_file_does_not_stop_the_pass() {
        let dir = tempdir().unwrap();
        let partition = dir.path();
        // A directory cannot be read as a file, so compressing it fails
        std::fs::create_dir(partition.join("readings_112233445566.json")).unwrap();
        std::fs::write(partition.join("readings_aabbccddeeff.json"), "[3]").unwrap();

        let summary = compress_partition_dir(partition).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.compressed, 1);
        assert!(partition.join("readings_112233445566.json").is_dir());
        assert_eq!(
            read_maybe_compressed(&partition.join("readings_aabbccddeeff.json.gz")).unwrap(),
            b"[3]"
        );
    }

    #[test]
    fn test_leftover_original_is_recompressed() {
        let dir = tempdir().unwrap();
        let partition = dir.path();
        let original = partition.join("readings_aabbccddeeff.json");
        std::fs::write(&original, "[2]").unwrap();
        // Simulate a previous pass that wrote a stale twin but never removed the original
        std::fs::write(compressed_path(&original), gzip(b"[1]").unwrap()).unwrap();

        let summary = compress_partition_dir(partition).unwrap();
        assert_eq!(summary.compressed, 1);
        assert!(!original.exists());
        assert_eq!(
            read_maybe_compressed(&compressed_path(&original)).unwrap(),
            b"[2]"
        );
    }
}
