use crate::{util::ProgressTarget, PathBuf};
use anyhow::{Context as _, Error};
use std::io::Read as _;

/// Shared state for a single run: where the content-addressed cache and
/// staging/working directories live, the HTTP client used for manifest and
/// payload fetches, and the progress draw target.
pub struct Ctx {
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub client: ureq::Agent,
    pub draw_target: ProgressTarget,
    _temp: Option<tempfile::TempDir>,
}

impl Ctx {
    /// Uses a process-lifetime temporary directory for both the cache and
    /// staging areas; nothing downloaded this run is reused by a later one.
    pub fn with_temp(draw_target: ProgressTarget, client: ureq::Agent) -> Result<Self, Error> {
        let temp = tempfile::TempDir::new().context("unable to create temporary directory")?;
        let work_dir = PathBuf::from_path_buf(temp.path().to_owned())
            .map_err(|p| anyhow::anyhow!("temp dir {} is not utf-8", p.display()))?;
        let cache_dir = work_dir.join("cache");
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("unable to create '{cache_dir}'"))?;

        Ok(Self {
            cache_dir,
            work_dir,
            client,
            draw_target,
            _temp: Some(temp),
        })
    }

    /// Persists the cache under `dir` so subsequent runs reuse already
    /// verified payloads.
    pub fn with_dir(
        dir: PathBuf,
        draw_target: ProgressTarget,
        client: ureq::Agent,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&dir).with_context(|| format!("unable to create '{dir}'"))?;
        let cache_dir = dir.join("cache");
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("unable to create '{cache_dir}'"))?;

        Ok(Self {
            cache_dir,
            work_dir: dir,
            client,
            draw_target,
            _temp: None,
        })
    }

    /// A simple blocking GET used for manifest fetches, which are small
    /// enough not to need the chunked/cancellable path the downloader uses
    /// for payloads.
    pub fn get(&self, url: &str) -> Result<Vec<u8>, Error> {
        let response = self
            .client
            .get(url)
            .call()
            .with_context(|| format!("request to '{url}' failed"))?;

        let mut buf = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut buf)
            .with_context(|| format!("failed to read response body from '{url}'"))?;

        Ok(buf)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    pub fn ensure_staging_dir(&self) -> Result<PathBuf, Error> {
        let dir = self.staging_dir();
        std::fs::create_dir_all(&dir).with_context(|| format!("unable to create '{dir}'"))?;
        Ok(dir)
    }
}
