//! Streaming content fingerprints.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use xxhash_rust::xxh64::Xxh64;

/// Read size per chunk. Large files are streamed, never slurped.
const CHUNK_SIZE: usize = 16 * 1024;

/// Hash a file's contents into a 16-char lowercase hex fingerprint.
///
/// Equal bytes always produce equal fingerprints; a differing fingerprint
/// means the content changed. This is a change-detection digest, not an
/// authentication token.
pub async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = File::open(path).await?;
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:016x}", hasher.digest()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_equal_contents_equal_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.txt", b"same bytes");
        let b = write_temp(&dir, "b.txt", b"same bytes");

        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_different_contents_differ() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.txt", b"one");
        let b = write_temp(&dir, "b.txt", b"two");

        assert_ne!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }

    #[tokio::test]
    async fn test_fingerprint_is_16_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.txt", b"payload");

        let fp = hash_file(&a).await.unwrap();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_streaming_matches_one_shot() {
        // A file spanning several chunks hashes the same as the whole buffer.
        let dir = tempfile::tempdir().unwrap();
        let contents = vec![0xabu8; CHUNK_SIZE * 3 + 17];
        let a = write_temp(&dir, "big.bin", &contents);

        let expected = format!("{:016x}", xxhash_rust::xxh64::xxh64(&contents, 0));
        assert_eq!(hash_file(&a).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("gone.txt")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_empty_file_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "empty", b"");
        assert_eq!(hash_file(&a).await.unwrap().len(), 16);
    }
}
