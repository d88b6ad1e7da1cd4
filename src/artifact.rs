// src/artifact.rs
//
// =============================================================================
// REELFORGE: ARTIFACT STORE (v 0.1 )
// =============================================================================
//
// Unlike a content-addressable notary, artifact identity here is just the job
// id: one completed job produces exactly one file at a fixed, predictable
// path (§6.3). The durability concern carried over from the same corner of
// the codebase that built a hash-addressed store is the atomic-rename one --
// a reader must never observe a partially written file.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct ArtifactStore {
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output dir {:?}", output_dir))?;
        Ok(Self { output_dir })
    }

    pub fn final_path(&self, job_id: Uuid) -> PathBuf {
        self.output_dir.join(format!("{job_id}.mp4"))
    }

    pub fn scratch_path(&self, job_id: Uuid) -> PathBuf {
        self.output_dir.join(format!(".{job_id}.mp4.tmp"))
    }

    /// Moves a scratch file produced by the generator into its final,
    /// publicly addressable location. Renames atomically within the same
    /// filesystem; falls back to copy+delete if the generator wrote its
    /// scratch file elsewhere (e.g. a different mount).
    pub fn commit(&self, scratch_path: &Path, job_id: Uuid) -> Result<PathBuf> {
        let final_path = self.final_path(job_id);

        if fs::rename(scratch_path, &final_path).is_err() {
            fs::copy(scratch_path, &final_path)
                .context("failed to copy artifact into place across devices")?;
            fs::remove_file(scratch_path).ok();
        }

        if let Some(dir) = final_path.parent() {
            if let Ok(dir_handle) = File::open(dir) {
                let _ = dir_handle.sync_all();
            }
        }

        Ok(final_path)
    }

    pub fn remove(&self, job_id: Uuid) -> std::io::Result<()> {
        let path = self.final_path(job_id);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, job_id: Uuid) -> bool {
        self.final_path(job_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn commit_renames_scratch_into_final_path() {
        let dir = std::env::temp_dir().join(format!("reelforge_artifact_test_{}", Uuid::new_v4()));
        let store = ArtifactStore::new(&dir).unwrap();
        let job_id = Uuid::new_v4();

        let scratch = store.scratch_path(job_id);
        let mut f = File::create(&scratch).unwrap();
        f.write_all(b"fake-mp4").unwrap();

        let final_path = store.commit(&scratch, job_id).unwrap();
        assert!(final_path.exists());
        assert!(!scratch.exists());
        assert_eq!(final_path, store.final_path(job_id));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn remove_is_idempotent_when_absent() {
        let dir = std::env::temp_dir().join(format!("reelforge_artifact_test_{}", Uuid::new_v4()));
        let store = ArtifactStore::new(&dir).unwrap();
        store.remove(Uuid::new_v4()).unwrap();
        fs::remove_dir_all(&dir).ok();
    }
}
