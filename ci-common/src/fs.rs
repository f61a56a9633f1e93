use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

pub async fn exists(entry: impl AsRef<Path>) -> Result<bool> {
    use tokio::io::ErrorKind::NotFound;

    let metadata = fs::metadata(entry).await;

    if let Err(err) = &metadata {
        if err.kind() == NotFound {
            return Ok(false);
        }
    }

    metadata?;

    Ok(true)
}

/// Total size in bytes of every regular file under `dir`, excluding any
/// top-level entry named `skip_dir_name` (used to exclude `.git`).
pub async fn dir_size_excluding(dir: impl AsRef<Path>, skip_dir_name: &str) -> Result<u64> {
    let dir = dir.as_ref();
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .with_context(|| format!("unable to read directory: {}", current.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if current == dir && entry.file_name() == skip_dir_name {
                continue;
            }

            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_dir_size_excluding_skips_named_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"12345").await.unwrap();
        fs::create_dir(dir.path().join(".git")).await.unwrap();
        fs::write(dir.path().join(".git").join("x"), b"ignored-bytes")
            .await
            .unwrap();

        let size = dir_size_excluding(dir.path(), ".git").await.unwrap();
        assert_eq!(size, 5);
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(!exists(&missing).await.unwrap());

        let present = dir.path().join("here");
        fs::write(&present, b"").await.unwrap();
        assert!(exists(&present).await.unwrap());
    }
}
