//! Job buckets.
//!
//! A bucket is a storage location scoped to one job run: the job can seed
//! it, write results into it, and the client mirrors it once the job is
//! over. Buckets are directories under the configured storage root and are
//! referenced by `file://` URLs.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::job::BucketContext;
use crate::protocol::JobBucketRef;

/// A bucket created for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBucket {
    pub path: PathBuf,
    pub reference: JobBucketRef,
}

impl JobBucket {
    /// Creates `<root>/<job_id>`. `job_id` must be a single normal path
    /// component.
    pub fn create(
        root: &Path,
        job_id: &str,
        access_key: &str,
        secret_key: &str,
    ) -> std::io::Result<Self> {
        let mut components = Path::new(job_id).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("job id {:?} is not a plain directory name", job_id),
            ));
        }

        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let path = root.join(job_id);
        std::fs::create_dir_all(&path)?;
        let path = path.canonicalize()?;
        if !path.starts_with(&root) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("bucket {} is outside {}", path.display(), root.display()),
            ));
        }

        Ok(Self {
            reference: JobBucketRef {
                name: job_id.to_string(),
                url: format!("file://{}", path.display()),
                access_key: access_key.to_string(),
                secret_key: secret_key.to_string(),
            },
            path,
        })
    }

    /// What job templates see of the bucket.
    pub fn context(&self) -> BucketContext {
        BucketContext {
            name: self.reference.name.clone(),
            url: self.reference.url.clone(),
            access_key: self.reference.access_key.clone(),
            secret_key: self.reference.secret_key.clone(),
        }
    }
}

/// Local path of a `file://` bucket URL.
pub fn local_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Copies a bucket into `dest`, returning how many files were copied.
pub fn mirror(reference: &JobBucketRef, dest: &Path) -> std::io::Result<usize> {
    let source = local_path(&reference.url).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("cannot mirror bucket url {}", reference.url),
        )
    })?;
    copy_tree(&source, dest)
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dest)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            debug!("Mirrored {}", target.display());
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_mirror() {
        let storage = tempfile::tempdir().unwrap();
        let bucket = JobBucket::create(storage.path(), "job-42", "ak", "sk").unwrap();
        assert!(bucket.path.is_dir());
        assert!(bucket.reference.url.starts_with("file://"));
        assert_eq!(bucket.context().access_key, "ak");

        std::fs::create_dir_all(bucket.path.join("results")).unwrap();
        std::fs::write(bucket.path.join("console.log"), "log").unwrap();
        std::fs::write(bucket.path.join("results/junit.xml"), "<xml/>").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let copied = mirror(&bucket.reference, dest.path()).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("results/junit.xml")).unwrap(),
            "<xml/>"
        );
    }

    #[test]
    fn test_bucket_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("buckets");
        for id in ["../outside", "/tmp/outside", "a/b", "..", "."] {
            let err = JobBucket::create(&root, id, "", "").unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "job id {:?}", id);
        }
        assert!(!dir.path().join("outside").exists());
    }

    #[test]
    fn test_only_file_urls_are_mirrored() {
        let reference = JobBucketRef {
            name: "job".to_string(),
            url: "s3://bucket/job".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
        };
        let dest = tempfile::tempdir().unwrap();
        assert!(mirror(&reference, dest.path()).is_err());
    }
}
