//! Maps request paths onto stored assets.
//!
//! Two strategies run in order and the first hit wins:
//! an exact match (`P.gz` before `P`), then for extension-less paths an HTML
//! fallback (`P.html.gz` before `P.html`).

use crate::storage::Storage;

const GZIP_SUFFIX: &str = ".gz";
const HTML_SUFFIX: &str = ".html";

const MIME_TABLE: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".css", "text/css"),
    (".js", "application/javascript"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".ico", "image/x-icon"),
    (".xml", "text/xml"),
    (".pdf", "application/x-pdf"),
    (".zip", "application/x-zip"),
];

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
pub const DOWNLOAD_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub path: String,
    /// Set when the client asked for a download rather than inline rendering.
    pub download: bool,
}

impl AssetRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            download: false,
        }
    }

    pub fn download(mut self) -> Self {
        self.download = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub storage_path: String,
    pub content_type: &'static str,
    pub is_compressed: bool,
}

pub fn content_type_for(path: &str, download: bool) -> &'static str {
    if download {
        return DOWNLOAD_CONTENT_TYPE;
    }
    MIME_TABLE
        .iter()
        .find(|(suffix, _)| path.ends_with(suffix))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// True when the last path segment carries no `.`.
pub fn has_extension(path: &str) -> bool {
    match (path.rfind('.'), path.rfind('/')) {
        (Some(dot), Some(slash)) => dot > slash,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

pub fn normalize(path: &str) -> String {
    if path.ends_with('/') {
        format!("{path}index")
    } else {
        path.to_string()
    }
}

/// Content resolver over a storage backend, with paths it must never expose.
pub struct Resolver {
    reserved: Vec<String>,
}

impl Resolver {
    pub fn new(reserved: Vec<String>) -> Self {
        Self { reserved }
    }

    async fn present(&self, storage: &dyn Storage, path: &str) -> bool {
        !self.reserved.iter().any(|r| r == path) && storage.exists(path).await
    }

    /// Prefers `<base>.gz`, then `<base>`.
    async fn pick(&self, storage: &dyn Storage, base: &str) -> Option<(String, bool)> {
        let compressed = format!("{base}{GZIP_SUFFIX}");
        if self.present(storage, &compressed).await {
            return Some((compressed, true));
        }
        if self.present(storage, base).await {
            return Some((base.to_string(), false));
        }
        None
    }

    pub async fn resolve(
        &self,
        storage: &dyn Storage,
        request: &AssetRequest,
    ) -> Option<ResolvedAsset> {
        let path = normalize(&request.path);

        if let Some((storage_path, is_compressed)) = self.pick(storage, &path).await {
            return Some(ResolvedAsset {
                storage_path,
                content_type: content_type_for(&path, request.download),
                is_compressed,
            });
        }

        if has_extension(&path) {
            return None;
        }

        let html = format!("{path}{HTML_SUFFIX}");
        self.pick(storage, &html)
            .await
            .map(|(storage_path, is_compressed)| ResolvedAsset {
                storage_path,
                content_type: "text/html",
                is_compressed,
            })
    }
}
