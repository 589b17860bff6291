//! Local files: outbound sources read chunk by chunk, inbound files saved to the download dir.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Context;
use mesh_core::{TransferDescriptor, TransferId};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Build a descriptor for a local file.
pub async fn describe(path: &Path) -> anyhow::Result<TransferDescriptor> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(TransferDescriptor::new(name, meta.len(), mime.essence_str()).with_last_modified(modified))
}

/// Paths of queued outbound files, kept until the core releases them.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    paths: HashMap<TransferId, PathBuf>,
}

impl SourceRegistry {
    pub fn insert(&mut self, id: TransferId, path: PathBuf) {
        self.paths.insert(id, path);
    }

    pub fn get(&self, id: &TransferId) -> Option<&PathBuf> {
        self.paths.get(id)
    }

    pub fn release(&mut self, id: &TransferId) -> Option<PathBuf> {
        self.paths.remove(id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Read exactly `len` bytes at `offset`.
pub async fn read_chunk(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".into()
    } else {
        trimmed.to_string()
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first n that does not exist yet.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Save a received file without overwriting anything. Returns the final path.
pub async fn save(dir: &Path, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = unique_path(dir, &sanitize_file_name(name));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_reduced_to_one_component() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".bashrc"), "bashrc");
        assert_eq!(sanitize_file_name("a\nb"), "a_b");
        assert_eq!(sanitize_file_name(""), "download");
        assert_eq!(sanitize_file_name("dir/"), "download");
    }

    #[test]
    fn existing_names_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a (2).txt"));
        assert_eq!(unique_path(dir.path(), "b.txt"), dir.path().join("b.txt"));
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "README"), dir.path().join("README (1)"));
    }

    #[tokio::test]
    async fn chunks_read_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(read_chunk(&path, 0, 10).await.unwrap(), &data[..10]);
        assert_eq!(read_chunk(&path, 990, 10).await.unwrap(), &data[990..]);
        assert!(read_chunk(&path, 995, 10).await.is_err());
    }

    #[tokio::test]
    async fn describe_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        let d = describe(&path).await.unwrap();
        assert_eq!((d.name.as_str(), d.byte_size), ("notes.txt", 5));
        assert_eq!(d.mime_type, "text/plain");
        assert!(d.last_modified > 0);
        assert!(describe(dir.path()).await.is_err());

        let out = dir.path().join("in");
        let first = save(&out, "notes.txt", b"one").await.unwrap();
        let second = save(&out, "notes.txt", b"two").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }
}
