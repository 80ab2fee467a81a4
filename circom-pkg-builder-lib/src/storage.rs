use crate::config::{StoreConfig, StoreKind};
use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::RngCore;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const SOURCE_ZIP: &str = "source.zip";
pub const VERIFIER_SOL: &str = "verifier.sol";
pub const PKG_ZIP: &str = "pkg.zip";
/// Written last; its presence marks a complete package.
pub const INFO_JSON: &str = "info.json";

pub fn package_key(pkg_name: &str, object: &str) -> String {
    format!("{}/{}", pkg_name, object)
}

pub fn status_key(request_id: &str) -> String {
    format!("status/{}.json", request_id)
}

/// Durable key/value blob storage. Every `put` is all-or-nothing.
pub trait ObjectStore: Send + Sync + fmt::Debug {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Deleting a missing key is not an error.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Builds the store selected by configuration.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.kind {
        StoreKind::Fs => Ok(Arc::new(FsObjectStore::new(
            config.root.clone(),
            config.timeout(),
        )?)),
        StoreKind::Http => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                Error::ConfigError("store.base_url is required for the http store".to_string())
            })?;
            Ok(Arc::new(HttpObjectStore::new(base_url, config.timeout())?))
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    op: &str,
    key: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{} {} after {:?}", op, key, timeout))),
    }
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    timeout: Duration,
}

impl FsObjectStore {
    pub fn new(root: PathBuf, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, timeout })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::StoreError(format!("Invalid object key: {}", key)));
        }
        Ok(self.root.join(rel))
    }

    async fn write_atomic(&self, path: PathBuf, bytes: Vec<u8>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut suffix = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp = path.with_extension(format!("tmp-{}", hex::encode(suffix)));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        _content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_for(key)?;
            debug!(%key, len = bytes.len(), "Writing object");
            bounded(self.timeout, "put", key, self.write_atomic(path, bytes)).await
        }
        .boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            let path = self.path_for(key)?;
            bounded(self.timeout, "get", key, async {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::from(e)),
                }
            })
            .await
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_for(key)?;
            bounded(self.timeout, "delete", key, async {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(Error::from(e)),
                }
            })
            .await
        }
        .boxed()
    }
}

/// Talks to a bucket endpoint that accepts `PUT`/`GET`/`DELETE` per key.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(mut base_url: Url, timeout: Duration) -> Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        if key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(Error::StoreError(format!("Invalid object key: {}", key)));
        }
        Ok(self.base_url.join(key)?)
    }
}

impl ObjectStore for HttpObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        bytes: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let url = self.url_for(key)?;
            bounded(self.timeout, "put", key, async {
                self.client
                    .put(url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, Error>(())
            })
            .await
        }
        .boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            let url = self.url_for(key)?;
            bounded(self.timeout, "get", key, async {
                let response = self.client.get(url).send().await?;
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let bytes = response.error_for_status()?.bytes().await?;
                Ok::<_, Error>(Some(bytes.to_vec()))
            })
            .await
        }
        .boxed()
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            let url = self.url_for(key)?;
            bounded(self.timeout, "delete", key, async {
                let response = self.client.delete(url).send().await?;
                if response.status() != reqwest::StatusCode::NOT_FOUND {
                    response.error_for_status()?;
                }
                Ok::<_, Error>(())
            })
            .await
        }
        .boxed()
    }
}
