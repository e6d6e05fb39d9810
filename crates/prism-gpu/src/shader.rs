//! Loading precompiled SPIR-V shader binaries.

use crate::error::{GpuError, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Read a SPIR-V binary into 32-bit words.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();

    let mut file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => GpuError::FileNotFound(path.to_path_buf()),
        _ => GpuError::ShaderLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })?;

    let words = ash::util::read_spv(&mut file).map_err(|e| GpuError::ShaderLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    tracing::debug!("Loaded shader {} ({} words)", path.display(), words.len());
    Ok(words)
}

/// The vertex and fragment stages of the graphics pipeline.
#[derive(Debug, Clone)]
pub struct ShaderPair {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderPair {
    /// Load both stages from disk.
    pub fn load(vertex_path: &Path, fragment_path: &Path) -> Result<Self> {
        Ok(Self {
            vertex: load_spirv(vertex_path)?,
            fragment: load_spirv(fragment_path)?,
        })
    }
}

/// Paths of the two shader binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl ShaderPaths {
    pub fn new(vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    /// Load both stages.
    pub fn load(&self) -> Result<ShaderPair> {
        ShaderPair::load(&self.vertex, &self.fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("prism-{}-{name}", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let path = std::env::temp_dir().join("prism-does-not-exist.spv");
        let result = load_spirv(&path);
        assert!(matches!(result, Err(GpuError::FileNotFound(p)) if p == path));
    }

    #[test]
    fn spirv_words_are_read_whole() {
        let mut bytes = Vec::new();
        for word in [0x0723_0203_u32, 0x0001_0000, 0, 42] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let path = temp_file("words.spv", &bytes);

        let words = load_spirv(&path).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000, 0, 42]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncated_binary_is_a_load_error() {
        let path = temp_file("truncated.spv", &[0x03, 0x02, 0x23, 0x07, 0x00]);

        assert!(matches!(load_spirv(&path), Err(GpuError::ShaderLoad { .. })));

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn pair_reports_the_missing_stage() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x0723_0203_u32.to_le_bytes());
        let vertex = temp_file("pair.vert.spv", &bytes);
        let fragment = std::env::temp_dir().join("prism-missing.frag.spv");

        let result = ShaderPaths::new(&vertex, &fragment).load();
        assert!(matches!(result, Err(GpuError::FileNotFound(p)) if p == fragment));

        std::fs::remove_file(vertex).unwrap();
    }
}
