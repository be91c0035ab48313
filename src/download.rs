//! Concurrent, resumable, hash-verified payload downloading with a
//! content-addressed cache (spec §4.6).

use crate::{manifest::Payload, resolve::PackageKey, util::Sha256, Path, PathBuf};
use anyhow::{Context as _, Error};
use std::{
    io::{Read as _, Write as _},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

const MAX_ATTEMPTS: u32 = 5;
const CHUNK_SIZE: usize = 8 * 1024;

/// One payload to fetch into the cache, identified by the package it belongs
/// to so the on-disk layout is `<cache>/<PackageKey>/<basename>`.
pub struct DownloadTask {
    pub key: PackageKey,
    pub payload: Payload,
    pub progress: indicatif::ProgressBar,
}

/// Cooperative cancellation flag observed at chunk and attempt boundaries.
pub type CancelToken = Arc<AtomicBool>;

pub struct Downloader {
    client: ureq::Agent,
    cache_dir: PathBuf,
    cancel: CancelToken,
    /// When set, a payload that fails checksum verification after all
    /// retries is only warned about, not treated as fatal, so the user can
    /// still inspect the downloaded bytes (spec §4.6/§7).
    only_download: bool,
}

impl Downloader {
    pub fn new(client: ureq::Agent, cache_dir: PathBuf) -> Self {
        Self {
            client,
            cache_dir,
            cancel: Arc::new(AtomicBool::new(false)),
            only_download: false,
        }
    }

    pub fn with_only_download(mut self, only_download: bool) -> Self {
        self.only_download = only_download;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn dest_for(&self, key: &PackageKey, payload: &Payload) -> PathBuf {
        self.cache_dir.join(key.as_str()).join(payload.basename())
    }

    /// Downloads every task using a bounded worker pool, returning the total
    /// number of bytes actually transferred (cache hits count as zero).
    pub fn download_all(&self, tasks: Vec<DownloadTask>, workers: usize) -> Result<u64, Error> {
        let workers = workers.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<DownloadTask>();
        for task in tasks {
            tx.send(task).expect("channel receiver outlives sender");
        }
        drop(tx);

        let total_bytes = Arc::new(AtomicU64::new(0));
        let first_error: Arc<parking_lot::Mutex<Option<Error>>> =
            Arc::new(parking_lot::Mutex::new(None));

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let rx = rx.clone();
                let total_bytes = total_bytes.clone();
                let first_error = first_error.clone();

                handles.push(scope.spawn(|| {
                    while let Ok(task) = rx.recv() {
                        if self.cancel.load(Ordering::SeqCst) {
                            break;
                        }

                        match self.download_one(&task) {
                            Ok(bytes) => {
                                total_bytes.fetch_add(bytes, Ordering::Relaxed);
                            }
                            Err(err) => {
                                self.cancel.store(true, Ordering::SeqCst);
                                let mut slot = first_error.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                                break;
                            }
                        }
                    }
                }));
            }

            for handle in handles {
                let _ = handle.join();
            }
        });

        if let Ok(mutex) = Arc::try_unwrap(first_error) {
            if let Some(err) = mutex.into_inner() {
                return Err(err);
            }
        }

        Ok(total_bytes.load(Ordering::Relaxed))
    }

    fn download_one(&self, task: &DownloadTask) -> Result<u64, Error> {
        let dest = self.dest_for(&task.key, &task.payload);

        for attempt in 1..=MAX_ATTEMPTS {
            if self.cancel.load(Ordering::SeqCst) {
                anyhow::bail!("UserCancel: download of {} cancelled", task.payload.file_name);
            }

            if dest.exists() {
                match &task.payload.sha256 {
                    Some(expected) => {
                        let bytes = std::fs::read(&dest)
                            .with_context(|| format!("unable to read cached '{dest}'"))?;
                        if Sha256::digest(&bytes) == *expected {
                            tracing::debug!(%dest, "using existing file");
                            task.progress.inc(task.payload.size.unwrap_or(0));
                            return Ok(0);
                        }

                        tracing::warn!(%dest, "HashMismatch: removing existing file and retrying");
                        let _ = std::fs::remove_file(&dest);
                    }
                    None => {
                        task.progress.inc(task.payload.size.unwrap_or(0));
                        return Ok(0);
                    }
                }
            }

            match self.fetch_to(task, &dest) {
                Ok(bytes) => {
                    if let Some(expected) = &task.payload.sha256 {
                        let on_disk = std::fs::read(&dest)
                            .with_context(|| format!("unable to read downloaded '{dest}'"))?;
                        if Sha256::digest(&on_disk) != *expected {
                            if attempt == MAX_ATTEMPTS {
                                if self.only_download {
                                    tracing::warn!(
                                        file = %task.payload.file_name,
                                        "HashMismatch: failed checksum verification after {MAX_ATTEMPTS} attempts, keeping file since --only-download was requested"
                                    );
                                    return Ok(bytes);
                                }
                                let _ = std::fs::remove_file(&dest);
                                anyhow::bail!(
                                    "HashMismatch: {} failed checksum verification after {MAX_ATTEMPTS} attempts",
                                    task.payload.file_name
                                );
                            }
                            let _ = std::fs::remove_file(&dest);
                            tracing::warn!(file = %task.payload.file_name, attempt, "HashMismatch, retrying");
                            continue;
                        }
                    }
                    return Ok(bytes);
                }
                Err(err) => {
                    if attempt == MAX_ATTEMPTS {
                        return Err(err).with_context(|| {
                            format!(
                                "NetworkTransient: exhausted {MAX_ATTEMPTS} attempts downloading {}",
                                task.payload.file_name
                            )
                        });
                    }
                    tracing::warn!(error = %err, attempt, file = %task.payload.file_name, "NetworkTransient, retrying");
                }
            }
        }

        unreachable!("loop always returns or bails by the final attempt")
    }

    fn fetch_to(&self, task: &DownloadTask, dest: &Path) -> Result<u64, Error> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("unable to create cache directory '{parent}'"))?;
        }

        let response = self
            .client
            .get(&task.payload.url)
            .call()
            .with_context(|| format!("request to '{}' failed", task.payload.url))?;

        let mut reader = response.into_reader();
        let mut file =
            std::fs::File::create(dest).with_context(|| format!("unable to create '{dest}'"))?;

        let mut buf = [0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                drop(file);
                let _ = std::fs::remove_file(dest);
                anyhow::bail!(
                    "UserCancel: download of {} cancelled mid-transfer",
                    task.payload.file_name
                );
            }

            let n = reader.read(&mut buf).context("read from response body failed")?;
            if n == 0 {
                break;
            }

            file.write_all(&buf[..n])
                .with_context(|| format!("write to '{dest}' failed"))?;
            total += n as u64;
            task.progress.inc(n as u64);
        }

        Ok(total)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dest_for_uses_package_key_and_basename() {
        let downloader = Downloader::new(ureq::Agent::new(), PathBuf::from("/cache"));
        let payload = Payload {
            file_name: r"Installers\foo.cab".to_owned(),
            url: "https://example/foo.cab".to_owned(),
            size: Some(10),
            sha256: None,
        };

        let key = PackageKey::new(&crate::manifest::Variant {
            id: "Foo".to_owned(),
            version: Some("1.0".to_owned()),
            kind: "Component".to_owned(),
            chip: None,
            machine_arch: None,
            product_arch: None,
            language: None,
            payloads: Vec::new(),
            dependencies: Default::default(),
            install_sizes: None,
            localized_resources: Vec::new(),
        });

        let dest = downloader.dest_for(&key, &payload);
        assert_eq!(dest, PathBuf::from("/cache/Foo-1.0/foo.cab"));
    }
}
