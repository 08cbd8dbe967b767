//! Atomic ref-file persistence (§3 I2: "a reader sees either the previous bytes or the new
//! complete bytes"). Grounded on `utils.save_file_atomic`: write to a sibling temp file, then
//! `rename` into place, so concurrent writers of the same ref never produce a torn file (§5,
//! §8 R4).

use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Writes `bytes` to `path` atomically, creating parent directories as needed.
pub(crate) async fn save_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let tmp_path = dir.join(format!(".tmp-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
    let write_result = async {
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(bytes).await?;
        tmp.sync_all().await
    }
    .await;
    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("ref-name");

        save_atomic(&path, b"first").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");

        save_atomic(&path, b"second, and longer").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second, and longer");
    }
}
