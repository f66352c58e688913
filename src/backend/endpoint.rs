use url::Url;

/// A downstream engine the relay forwards work to. Built once at startup and
/// shared read-only between requests.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    name: &'static str,
    base: Url,
    response_content_type: Option<String>,
}

impl BackendEndpoint {
    /// The base URL is normalized to end in a slash so [`Self::route`]
    /// appends to the path instead of replacing its last segment.
    pub fn new(name: &'static str, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        BackendEndpoint {
            name,
            base,
            response_content_type: None,
        }
    }

    /// Content type this backend is expected to answer with. Used as the
    /// fallback when the backend omits the header.
    pub fn with_response_content_type(mut self, content_type: &str) -> Self {
        self.response_content_type = Some(content_type.to_string());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn response_content_type(&self) -> Option<&str> {
        self.response_content_type.as_deref()
    }

    /// Joins a relative route onto the base URL.
    pub fn route(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}
