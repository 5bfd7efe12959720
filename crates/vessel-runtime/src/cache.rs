// Ported from microsoft/wassette (MIT License, with vessel-specific modifications)
// Copyright (c) Microsoft Corporation.

use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};
use wasmtime::Engine;
use wasmtime::component::Component;

use crate::error::RuntimeError;

const PRECOMPILED_EXT: &str = "cwasm";

/// Disk cache of precompiled components.
///
/// Layout under `base_dir`:
/// ```text
/// {base_dir}/
///   {sha256 of source}.cwasm   - Wasmtime serialized component
/// ```
///
/// Keyed by content, so a library rebuilt in place is recompiled and two
/// paths with the same bytes share one artifact.
pub struct ArtifactCache {
    base_dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vessel")
            .join("cache")
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.base_dir.join(format!("{hash}.{PRECOMPILED_EXT}"))
    }

    /// Compile the component at `source`, or load its precompiled artifact.
    /// Returns the component and the SHA-256 hex of the source bytes.
    pub fn load_or_compile(
        &self,
        source: &Path,
        engine: &Engine,
    ) -> Result<(Component, String), RuntimeError> {
        let bytes = std::fs::read(source).map_err(|e| {
            RuntimeError::ComponentNotFound(format!("{}: {e}", source.display()))
        })?;
        let hash = hash_bytes(&bytes);
        let artifact = self.artifact_path(&hash);

        if artifact.exists() {
            match self.load_precompiled(&artifact, engine) {
                Ok(cached) => {
                    tracing::debug!(source = %source.display(), hash, "Loaded from precompiled cache");
                    return Ok((cached, hash));
                }
                Err(e) => {
                    tracing::debug!(source = %source.display(), error = %e, "Precompiled cache invalid, recompiling");
                }
            }
        }

        let component = Component::new(engine, &bytes)
            .map_err(|e| RuntimeError::CompilationFailed(format!("{}: {e}", source.display())))?;

        match component.serialize() {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(&artifact, serialized) {
                    tracing::warn!(artifact = %artifact.display(), error = %e, "Could not write precompiled cache");
                } else {
                    tracing::debug!(hash, "Saved precompiled cache");
                }
            }
            Err(e) => tracing::warn!(hash, error = %e, "Could not serialize component"),
        }

        Ok((component, hash))
    }

    fn load_precompiled(&self, path: &Path, engine: &Engine) -> Result<Component> {
        // SAFETY: artifacts in this directory are only written by
        // `load_or_compile` with an engine of the same Wasmtime version and
        // configuration, which is the contract `deserialize_file` requires.
        unsafe { Component::deserialize_file(engine, path) }
    }
}

/// SHA-256 hex digest of a component's bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::component_engine;

    const EMPTY_COMPONENT: &str = "(component)";

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_bytes(b"vessel");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_bytes(b"vessel"));
        assert_ne!(hash, hash_bytes(b"vessel2"));
    }

    #[test]
    fn compiles_once_then_loads_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty.wat");
        std::fs::write(&source, EMPTY_COMPONENT).unwrap();

        let cache = ArtifactCache::new(tmp.path().join("cache"));
        cache.init().unwrap();
        let engine = component_engine().unwrap();

        let (_, hash) = cache.load_or_compile(&source, &engine).unwrap();
        assert!(cache.artifact_path(&hash).exists());

        let (_, again) = cache.load_or_compile(&source, &engine).unwrap();
        assert_eq!(hash, again);
    }

    #[test]
    fn corrupt_artifact_is_recompiled() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty.wat");
        std::fs::write(&source, EMPTY_COMPONENT).unwrap();
        let cache = ArtifactCache::new(tmp.path().to_path_buf());
        let engine = component_engine().unwrap();

        let hash = hash_bytes(EMPTY_COMPONENT.as_bytes());
        std::fs::write(cache.artifact_path(&hash), b"not a cwasm").unwrap();
        cache.load_or_compile(&source, &engine).unwrap();
    }

    #[test]
    fn missing_source_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(tmp.path().to_path_buf());
        let engine = component_engine().unwrap();
        let err = cache
            .load_or_compile(&tmp.path().join("absent.wasm"), &engine)
            .err().unwrap();
        assert!(matches!(err, RuntimeError::ComponentNotFound(_)));
    }

    #[test]
    fn invalid_source_fails_compilation() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("garbage.wasm");
        std::fs::write(&source, b"\0asm garbage").unwrap();
        let cache = ArtifactCache::new(tmp.path().to_path_buf());
        let engine = component_engine().unwrap();
        let err = cache.load_or_compile(&source, &engine).err().unwrap();
        assert!(matches!(err, RuntimeError::CompilationFailed(_)));
    }
}
