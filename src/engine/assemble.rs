//! Final placement of downloaded bytes
//!
//! Single-stream jobs move their `.part` file into place; chunked jobs
//! concatenate their chunk files strictly in index order. Both replace whatever
//! already sits at the destination.

use std::path::{Path, PathBuf};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::models::JobId;

/// Temp file a single-stream job writes to
pub fn part_path(temp_dir: &Path, job: JobId) -> PathBuf {
    temp_dir.join(format!("{}.part", job))
}

/// Temp file keyed by `(job, chunk index)`
pub fn chunk_path(temp_dir: &Path, job: JobId, index: usize) -> PathBuf {
    temp_dir.join(format!("{}.{}.chunk", job, index))
}

/// Staging file chunks are concatenated into before it replaces the destination
pub fn assembling_path(temp_dir: &Path, job: JobId) -> PathBuf {
    temp_dir.join(format!("{}.assembling", job))
}

/// Move a file to `dest`, replacing it, and handling cross-filesystem moves.
///
/// `dest` is only touched once `src` is known to be readable.
pub async fn move_into_place(src: &Path, dest: &Path) -> std::io::Result<u64> {
    debug!(from = ?src, to = ?dest, "Moving download into place");

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Try atomic rename (fast path), it replaces an existing file
    if tokio::fs::rename(src, dest).await.is_err() {
        // copy opens the source before truncating the destination
        tokio::fs::copy(src, dest).await?;
        tokio::fs::remove_file(src).await?;
    }

    Ok(tokio::fs::metadata(dest).await?.len())
}

/// Concatenate `parts` in the given order into `staging`, then move the result
/// onto `dest`. Returns the number of bytes written.
///
/// Callers pass parts sorted by chunk index; completion order is irrelevant.
/// On error the staging file is removed and `dest` is left as it was.
pub async fn assemble_chunks(
    parts: &[PathBuf],
    staging: &Path,
    dest: &Path,
) -> std::io::Result<u64> {
    debug!(parts = parts.len(), to = ?dest, "Reassembling chunks");

    let result = match concatenate(parts, staging).await {
        Ok(_) => move_into_place(staging, dest).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(e) = remove_if_exists(staging).await {
            warn!(path = ?staging, error = %e, "Failed to remove staging file");
        }
    }
    result
}

/// Write `parts` back to back into `out_path`, deleting each part once copied
async fn concatenate(parts: &[PathBuf], out_path: &Path) -> std::io::Result<u64> {
    let mut out = File::create(out_path).await?;
    let mut total = 0;

    for part in parts {
        let mut input = File::open(part).await?;
        total += tokio::io::copy(&mut input, &mut out).await?;
        drop(input);
        tokio::fs::remove_file(part).await?;
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(total)
}

/// Delete a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use ulid::Ulid;

    #[tokio::test]
    async fn test_assemble_in_index_order() {
        let dir = tempdir().unwrap();
        let job = Ulid::new();
        let parts: Vec<PathBuf> = (0..3).map(|i| chunk_path(dir.path(), job, i)).collect();

        // written in reverse to make sure the file order, not creation order, counts
        tokio::fs::write(&parts[2], "C").await.unwrap();
        tokio::fs::write(&parts[1], "BB").await.unwrap();
        tokio::fs::write(&parts[0], "AAA").await.unwrap();

        let staging = assembling_path(dir.path(), job);
        let dest = dir.path().join("out").join("file.bin");
        let total = assemble_chunks(&parts, &staging, &dest).await.unwrap();

        assert_eq!(total, 6);
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "AAABBC");
        for part in &parts {
            assert!(!part.exists(), "chunk file should be consumed");
        }
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_assemble_truncates_existing_destination() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&dest, "an older and much longer file").await.unwrap();

        let job = Ulid::new();
        let part = chunk_path(dir.path(), job, 0);
        tokio::fs::write(&part, "new").await.unwrap();

        assemble_chunks(&[part], &assembling_path(dir.path(), job), &dest)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_move_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let job = Ulid::new();
        let src = part_path(dir.path(), job);
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&src, "fresh").await.unwrap();
        tokio::fs::write(&dest, "stale contents").await.unwrap();

        let len = move_into_place(&src, &dest).await.unwrap();
        assert_eq!(len, 5);
        assert!(!src.exists());
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_missing_part_keeps_existing_destination() {
        let dir = tempdir().unwrap();
        let job = Ulid::new();
        let parts: Vec<PathBuf> = (0..3).map(|i| chunk_path(dir.path(), job, i)).collect();
        tokio::fs::write(&parts[0], "AA").await.unwrap();
        tokio::fs::write(&parts[2], "CC").await.unwrap();
        let staging = assembling_path(dir.path(), job);
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&dest, "PREVIOUS GOOD FILE").await.unwrap();

        let err = assemble_chunks(&parts, &staging, &dest).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(
            tokio::fs::read_to_string(&dest).await.unwrap(),
            "PREVIOUS GOOD FILE"
        );
        assert!(!staging.exists());

        // nothing at all is created when there was no destination
        let fresh = dir.path().join("fresh.bin");
        assert!(assemble_chunks(&parts, &staging, &fresh).await.is_err());
        assert!(!fresh.exists());
    }

    #[tokio::test]
    async fn test_move_of_missing_source_keeps_destination() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        tokio::fs::write(&dest, "kept").await.unwrap();

        let missing = part_path(dir.path(), Ulid::new());
        assert!(move_into_place(&missing, &dest).await.is_err());
        assert_eq!(tokio::fs::read_to_string(&dest).await.unwrap(), "kept");
        assert!(remove_if_exists(&dir.path().join("nothing")).await.is_ok());
    }
}
