use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

/// Unpacks a container file into a scratch directory so that its members are
/// uploaded individually instead of the container.
pub trait ArchiveExpander: Send + Sync {
    fn matches(&self, file_name: &str) -> bool;

    /// Expand `archive` under `dest`. Returns member paths relative to `dest`.
    fn expand(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>>;
}

/// Single-stream `.zst` files expand to one member named after the container
/// without its extension.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZstdExpander;

impl ArchiveExpander for ZstdExpander {
    fn matches(&self, file_name: &str) -> bool {
        file_name.len() > 4 && file_name.ends_with(".zst")
    }

    fn expand(&self, archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
        let name = archive
            .file_stem()
            .with_context(|| format!("no member name for {:?}", archive))?;
        let member = PathBuf::from(name);
        let src = File::open(archive).with_context(|| format!("open {:?}", archive))?;
        let out_path = dest.join(&member);
        let mut out = BufWriter::new(
            File::create(&out_path).with_context(|| format!("create {:?}", out_path))?,
        );
        let mut decoder = zstd::stream::read::Decoder::new(BufReader::new(src))
            .with_context(|| format!("zstd header {:?}", archive))?;
        io::copy(&mut decoder, &mut out).with_context(|| format!("zstd decompress {:?}", archive))?;
        Ok(vec![member])
    }
}

/// Reject member names that would escape the scratch directory.
pub fn validate_member(rel: &Path) -> Result<()> {
    if rel.as_os_str().is_empty() || rel.is_absolute() {
        bail!("archive member has no relative name: {:?}", rel);
    }
    if rel.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        bail!("archive member escapes its directory: {:?}", rel);
    }
    Ok(())
}
