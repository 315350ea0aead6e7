use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Where a log stream lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// A fixed file path.
    File(PathBuf),
    /// The most recently modified file in `dir` whose name matches.
    /// Matching is case-insensitive; a missing prefix/suffix matches anything.
    Newest {
        dir: PathBuf,
        prefix: Option<String>,
        suffix: Option<String>,
    },
}

impl LogSource {
    pub fn newest(dir: impl Into<PathBuf>, prefix: Option<&str>, suffix: Option<&str>) -> Self {
        LogSource::Newest {
            dir: dir.into(),
            prefix: prefix.map(str::to_lowercase),
            suffix: suffix.map(str::to_lowercase),
        }
    }

    /// The file to read right now, if any exists yet.
    pub async fn resolve(&self) -> std::io::Result<Option<PathBuf>> {
        match self {
            LogSource::File(path) => Ok(Some(path.clone())),
            LogSource::Newest {
                dir,
                prefix,
                suffix,
            } => newest_match(dir, prefix.as_deref(), suffix.as_deref()).await,
        }
    }
}

fn matches(name: &str, prefix: Option<&str>, suffix: Option<&str>) -> bool {
    let name = name.to_lowercase();
    prefix.is_none_or(|p| name.starts_with(&p.to_lowercase()))
        && suffix.is_none_or(|s| name.ends_with(&s.to_lowercase()))
}

async fn newest_match(
    dir: &Path,
    prefix: Option<&str>,
    suffix: Option<&str>,
) -> std::io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut best: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches(name, prefix, suffix) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(t, _)| mtime > *t) {
            best = Some((mtime, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}
