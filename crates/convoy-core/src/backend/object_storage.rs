//! Object storage (S3 and anything else `object_store` can address).

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, parse_url_opts};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;
use url::Url;

use super::{Change, DocumentBackend, ensure_relative_path};

/// One object per storage path, below an optional key prefix.
///
/// The client is async; a private current-thread runtime drives it, so the
/// backend must not be used from inside another tokio runtime.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    runtime: Runtime,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start object store runtime")?;
        Ok(Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            runtime,
        })
    }

    /// Build from a URL such as `s3://bucket/convoy/state`. Credentials and region
    /// come from the usual `AWS_*` environment variables.
    pub fn with_url(url: &Url) -> anyhow::Result<Self> {
        let options = std::env::vars()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .filter(|(key, _)| key.starts_with("aws_"));
        let (store, path) = parse_url_opts(url, options)
            .with_context(|| format!("Failed to open object store at {}", url))?;
        Self::new(Arc::from(store), path.as_ref())
    }

    fn key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn strip_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(key);
        }
        key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')
    }
}

impl DocumentBackend for ObjectStoreBackend {
    fn read(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        ensure_relative_path(path)?;
        let location = ObjectPath::from(self.key(path));
        self.runtime.block_on(async {
            match self.store.get(&location).await {
                Ok(result) => {
                    let bytes = result
                        .bytes()
                        .await
                        .with_context(|| format!("Failed to read object {}", location))?;
                    Ok(Some(bytes.to_vec()))
                }
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("Failed to get object {}", location)),
            }
        })
    }

    fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        // Listing is by whole segments; list the enclosing directory and filter.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.key(&prefix[..idx]),
            None => self.prefix.clone(),
        };
        let dir = (!dir.is_empty()).then(|| ObjectPath::from(dir));
        let metas: Vec<_> = self.runtime.block_on(async {
            self.store
                .list(dir.as_ref())
                .try_collect::<Vec<_>>()
                .await
                .with_context(|| format!("Failed to list objects under '{}'", prefix))
        })?;

        let mut out: Vec<String> = metas
            .iter()
            .filter_map(|meta| self.strip_key(meta.location.as_ref()))
            .filter(|path| path.starts_with(prefix))
            .map(str::to_string)
            .collect();
        out.sort();
        Ok(out)
    }

    fn write_batch(&self, message: &str, changes: &[Change]) -> anyhow::Result<()> {
        debug!(prefix = %self.prefix, changes = changes.len(), message, "object store write");
        for change in changes {
            ensure_relative_path(&change.path)?;
            let location = ObjectPath::from(self.key(&change.path));
            self.runtime.block_on(async {
                match &change.data {
                    Some(data) => self
                        .store
                        .put(&location, PutPayload::from(data.clone()))
                        .await
                        .map(|_| ())
                        .with_context(|| format!("Failed to put object {}", location)),
                    None => match self.store.delete(&location).await {
                        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                        Err(err) => {
                            Err(err).with_context(|| format!("Failed to delete object {}", location))
                        }
                    },
                }
            })?;
        }
        Ok(())
    }
}
