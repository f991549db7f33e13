//! Ephemeral per-job folders.

use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use super::model::{PROGRAM_FILE, TESTINPUT_FILE};

pub const JOB_DIR_PREFIX: &str = "riker-job-";

/// The host folder a job runs in, holding exactly `program` and `testinput`.
///
/// The folder is deleted when this value is dropped, so every exit path of a
/// job (including panics) removes it. [`JobDir::close`] does the same but
/// reports failures.
#[derive(Debug)]
pub struct JobDir {
    dir: TempDir,
}

impl JobDir {
    pub async fn create(root: &Path, source: &str, stdin: &str) -> io::Result<JobDir> {
        tokio::fs::create_dir_all(root).await?;
        let dir = tempfile::Builder::new()
            .prefix(JOB_DIR_PREFIX)
            .tempdir_in(root)?;
        let job = JobDir { dir };

        tokio::fs::write(job.path().join(PROGRAM_FILE), source).await?;
        tokio::fs::write(job.path().join(TESTINPUT_FILE), stdin).await?;
        job.open_permissions()?;

        tracing::debug!(
            dir = %job.path().display(),
            source_len = source.len(),
            stdin_len = stdin.len(),
            "job folder ready"
        );
        Ok(job)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.path().to_owned()
    }

    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }

    // The sandbox user is not the host user and only ever reads this folder.
    #[cfg(unix)]
    fn open_permissions(&self) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(self.path(), std::fs::Permissions::from_mode(0o755))?;
        for file in [PROGRAM_FILE, TESTINPUT_FILE] {
            std::fs::set_permissions(
                self.path().join(file),
                std::fs::Permissions::from_mode(0o644),
            )?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn open_permissions(&self) -> io::Result<()> {
        Ok(())
    }
}
