use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Where a spawned service's stdout/stderr are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub fn service_logs(log_dir: &Path, name: &str) -> ServiceLogs {
    ServiceLogs {
        stdout: log_dir.join(format!("{name}.out.log")),
        stderr: log_dir.join(format!("{name}.err.log")),
    }
}

/// Opens both log files for appending, rotating each to `<file>.1` first
/// when it has grown past `max_size_bytes`.
pub fn open_log_writers(logs: &ServiceLogs, max_size_bytes: u64) -> io::Result<(File, File)> {
    if let Some(parent) = logs.stdout.parent() {
        fs::create_dir_all(parent)?;
    }

    rotate_if_needed(&logs.stdout, max_size_bytes)?;
    rotate_if_needed(&logs.stderr, max_size_bytes)?;

    Ok((open_append(&logs.stdout)?, open_append(&logs.stderr)?))
}

fn open_append(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn rotate_if_needed(path: &Path, max_size_bytes: u64) -> io::Result<()> {
    if max_size_bytes == 0 {
        return Ok(());
    }
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if size < max_size_bytes {
        return Ok(());
    }

    let rotated = PathBuf::from(format!("{}.1", path.display()));
    let _ = fs::remove_file(&rotated);
    fs::rename(path, rotated)
}
