use std::path::Path;
use std::sync::Arc;

use crate::Map;
use crate::common::error::usage_error;
use crate::jobspec::JobSpec;
use crate::jobspec::record::load_spec;

/// Named job specs of one visibility scope.
#[derive(Debug, Default, Clone)]
pub struct JobPool {
    specs: Map<String, Arc<JobSpec>>,
}

impl JobPool {
    /// Inserts a spec, replacing a previous spec of the same name.
    pub fn insert(&mut self, spec: JobSpec) -> crate::Result<Arc<JobSpec>> {
        if !spec.has_name() {
            return usage_error("Cannot add a job without a name into a pool".to_string());
        }
        let spec = Arc::new(spec);
        if self
            .specs
            .insert(spec.name().to_string(), spec.clone())
            .is_some()
        {
            log::debug!("Job {} replaced in pool", spec.name());
        }
        Ok(spec)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<JobSpec>> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Sorted names of all specs in the pool.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(|name| name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Loads every regular file of `directory` as a job record named after the file.
    /// Hidden files are skipped. Returns the number of loaded specs.
    pub fn load_dir(&mut self, directory: &Path, private: bool) -> crate::Result<usize> {
        let mut entries = std::fs::read_dir(directory)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut count = 0;
        for entry in entries {
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                log::warn!("Skipping job file with non UTF-8 name {file_name:?}");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let spec = load_spec(&entry.path(), Some(name), Some(private))?;
            self.insert(spec)?;
            count += 1;
        }
        log::debug!("Loaded {count} job(s) from {}", directory.display());
        Ok(count)
    }
}

/// Two level lookup of job specs: a private overlay shadowing a shared pool.
#[derive(Debug, Default, Clone)]
pub struct JobCatalog {
    shared: Arc<JobPool>,
    private: JobPool,
}

impl JobCatalog {
    pub fn new(shared: Arc<JobPool>) -> Self {
        Self {
            shared,
            private: JobPool::default(),
        }
    }

    pub fn shared(&self) -> &JobPool {
        &self.shared
    }

    pub fn private(&self) -> &JobPool {
        &self.private
    }

    /// Adds a spec into the private overlay. Shared specs are refused.
    pub fn add_private(&mut self, spec: JobSpec) -> crate::Result<Arc<JobSpec>> {
        if spec.is_shared() {
            return usage_error(format!(
                "Job {} is not private and cannot be added into a private scope",
                spec.name()
            ));
        }
        self.private.insert(spec)
    }

    pub fn load_private_dir(&mut self, directory: &Path) -> crate::Result<usize> {
        self.private.load_dir(directory, true)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<JobSpec>> {
        self.private
            .get(name)
            .or_else(|| self.shared.get(name))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::{JobCatalog, JobPool};
    use crate::Error;
    use crate::jobspec::JobSpec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn spec(name: &str, exe: &str, private: bool) -> JobSpec {
        let mut spec = JobSpec::new(name);
        spec.set_executable(exe);
        spec.set_private(private);
        spec
    }

    #[test]
    fn private_shadows_shared() {
        let mut shared = JobPool::default();
        shared.insert(spec("ECLIPSE", "/shared/eclipse", false)).unwrap();
        shared.insert(spec("RMS", "/shared/rms", false)).unwrap();

        let mut catalog = JobCatalog::new(Arc::new(shared));
        catalog
            .add_private(spec("ECLIPSE", "/home/user/eclipse", true))
            .unwrap();

        assert_eq!(
            catalog.lookup("ECLIPSE").unwrap().executable(),
            Some("/home/user/eclipse")
        );
        assert_eq!(
            catalog.lookup("RMS").unwrap().executable(),
            Some("/shared/rms")
        );
        assert!(catalog.lookup("MISSING").is_none());
        assert_eq!(
            catalog.shared().get("ECLIPSE").unwrap().executable(),
            Some("/shared/eclipse")
        );
    }

    #[test]
    fn shared_spec_cannot_be_added_as_private() {
        let mut catalog = JobCatalog::default();
        assert!(matches!(
            catalog.add_private(spec("A", "/bin/a", false)),
            Err(Error::UsageError(_))
        ));
        assert!(catalog.private().is_empty());
    }

    #[test]
    fn unnamed_spec_cannot_be_inserted() {
        let mut pool = JobPool::default();
        let mut unnamed = JobSpec::unnamed();
        unnamed.set_executable("/bin/true");
        assert!(matches!(pool.insert(unnamed), Err(Error::UsageError(_))));
        assert!(pool.is_empty());
    }

    #[test]
    fn load_dir_names_after_files() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        std::fs::write(dir.path().join("B_JOB"), "EXECUTABLE /bin/b\n").unwrap();
        std::fs::write(dir.path().join("A_JOB"), "EXECUTABLE /bin/a\n").unwrap();
        std::fs::write(dir.path().join(".hidden"), "garbage").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let mut pool = JobPool::default();
        assert_eq!(pool.load_dir(dir.path(), false).unwrap(), 2);
        assert_eq!(pool.names(), vec!["A_JOB", "B_JOB"]);
        assert!(pool.get("A_JOB").unwrap().is_shared());

        let mut catalog = JobCatalog::new(Arc::new(pool));
        catalog.load_private_dir(dir.path()).unwrap();
        assert!(catalog.lookup("B_JOB").unwrap().is_private());
    }

    #[test]
    fn load_dir_fails_on_invalid_record() {
        let dir = TempDir::with_prefix("batchq").unwrap();
        std::fs::write(dir.path().join("BROKEN"), "UNKNOWN_KEY 1\n").unwrap();
        let mut pool = JobPool::default();
        assert!(pool.load_dir(dir.path(), false).is_err());
    }
}
