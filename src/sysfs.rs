use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Read-only view of the sysfs tree holding the kernel's counter registries.
/// Defaults to `/` in production, redirectable to a temp directory so the
/// perf-event registry walk can run against fixtures.
#[derive(Debug, Clone)]
pub struct SysfsRoot {
    root: PathBuf,
}

impl Default for SysfsRoot {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }
}

impl SysfsRoot {
    /// The real system tree.
    pub fn system() -> Self {
        Self::default()
    }

    /// A tree rooted at a custom directory (fixtures).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a path relative to this root, e.g.
    /// `path("sys/bus/event_source/devices/power/type")`.
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a registry file, trimming whitespace.
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<String> {
        let path = self.path(relative);
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::RegistryRead { path, source: e })
    }

    /// Read a registry file, returning None if it does not exist. Anything
    /// other than absence (including a permission error) is a real failure.
    pub fn read_optional(&self, relative: impl AsRef<Path>) -> Result<Option<String>> {
        let path = self.path(relative);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::RegistryRead { path, source: e }),
        }
    }

    /// Read a registry file and parse its contents.
    pub fn read_parse<T: std::str::FromStr>(&self, relative: impl AsRef<Path>) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        let relative = relative.as_ref();
        let value = self.read(relative)?;
        value.parse::<T>().map_err(|e| Error::Parse {
            path: self.path(relative),
            detail: format!("failed to parse '{}': {}", value, e),
        })
    }

    /// List entries of a directory under this root, sorted by name.
    pub fn list_dir(&self, relative: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = self.path(relative);
        let entries = std::fs::read_dir(&path).map_err(|e| Error::RegistryRead {
            path: path.clone(),
            source: e,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::RegistryRead {
                path: path.clone(),
                source: e,
            })?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Check whether a path exists relative to this root.
    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.path(relative).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn read_and_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = SysfsRoot::new(tmp.path());

        fs::create_dir_all(tmp.path().join("sys/bus/event_source/devices/power")).unwrap();
        fs::write(
            tmp.path().join("sys/bus/event_source/devices/power/type"),
            "23\n",
        )
        .unwrap();

        assert_eq!(
            sysfs
                .read("sys/bus/event_source/devices/power/type")
                .unwrap(),
            "23"
        );
        assert_eq!(
            sysfs
                .read_parse::<u32>("sys/bus/event_source/devices/power/type")
                .unwrap(),
            23
        );
    }

    #[test]
    fn read_optional_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = SysfsRoot::new(tmp.path());

        assert!(sysfs.read_optional("sys/no/such/file").unwrap().is_none());
    }

    #[test]
    fn parse_failure_names_the_path() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = SysfsRoot::new(tmp.path());

        fs::create_dir_all(tmp.path().join("sys")).unwrap();
        fs::write(tmp.path().join("sys/type"), "not-a-number\n").unwrap();

        match sysfs.read_parse::<u32>("sys/type") {
            Err(Error::Parse { path, .. }) => {
                assert!(path.ends_with("sys/type"));
            }
            other => panic!("expected parse error, got {:?}", other.err()),
        }
    }

    #[test]
    fn list_dir_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = SysfsRoot::new(tmp.path());

        fs::create_dir_all(tmp.path().join("sys/devices/system/cpu/cpu1")).unwrap();
        fs::create_dir_all(tmp.path().join("sys/devices/system/cpu/cpu0")).unwrap();

        let entries = sysfs.list_dir("sys/devices/system/cpu").unwrap();
        assert_eq!(entries, vec!["cpu0", "cpu1"]);
    }
}
