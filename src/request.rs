use std::path::PathBuf;

use bytes::Bytes;
use encoding_rs::Encoding;
use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;

use crate::config::RequestConfig;
use crate::entity::{APPLICATION_JSON, Entity, Part, PartBody, TEXT_PLAIN, basic_credentials};
use crate::error::HttpClientError;
use crate::util::{parse_header_name, parse_header_value};

/// Mutable description of one outbound request.
///
/// Mutators consume and return the builder so calls chain. Nothing is validated
/// until [`RequestSpec::finalize`].
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: String,
    url: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    entity: Entity,
    config: RequestConfig,
}

impl RequestSpec {
    pub fn new(method: impl AsRef<str>, url: impl Into<String>, config: RequestConfig) -> Self {
        Self {
            method: method.as_ref().trim().to_ascii_uppercase(),
            url: url.into(),
            params: Vec::new(),
            headers: Vec::new(),
            content_type: None,
            entity: Entity::Empty,
            config,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn configure(mut self, update: impl FnOnce(RequestConfig) -> RequestConfig) -> Self {
        self.config = update(self.config);
        self
    }

    pub fn add_param(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.params
            .push((name.as_ref().trim().to_owned(), value.into()));
        self
    }

    pub fn add_params<K, V, I>(self, params: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        params
            .into_iter()
            .fold(self, |spec, (name, value)| spec.add_param(name, value))
    }

    /// Appends a header value; a repeated name keeps every value.
    ///
    /// `Content-Type` goes to the body content-type slot instead.
    pub fn add_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().trim();
        if name.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
            self.content_type = Some(value.into());
        } else {
            self.headers.push((name.to_owned(), value.into()));
        }
        self
    }

    pub fn add_headers<K, V, I>(self, headers: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        headers
            .into_iter()
            .fold(self, |spec, (name, value)| spec.add_header(name, value))
    }

    /// Replaces every value of `name` with `value`.
    pub fn set_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let trimmed = name.as_ref().trim();
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(trimmed));
        self.add_header(trimmed, value)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        if name.trim().eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
            return self.content_type.as_deref();
        }
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name.trim()))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn set_body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.entity = Entity::Bytes(body.into());
        self
    }

    /// Text body encoded with the request's query charset.
    pub fn set_body_text(self, text: impl AsRef<str>) -> Self {
        let charset = self.config.query_charset;
        self.set_body_text_with_charset(text, charset)
    }

    pub fn set_body_text_with_charset(
        mut self,
        text: impl AsRef<str>,
        charset: &'static Encoding,
    ) -> Self {
        self.entity = Entity::text(text.as_ref(), TEXT_PLAIN, charset);
        self
    }

    pub fn set_body_json<T>(mut self, payload: &T) -> Result<Self, HttpClientError>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(payload)
            .map_err(|source| HttpClientError::SerializeJson { source })?;
        self.entity = Entity::text(&text, APPLICATION_JSON, self.config.query_charset);
        Ok(self)
    }

    pub fn add_form_param(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.entity
            .push_form_param(name.as_ref().trim().to_owned(), value.into());
        self
    }

    pub fn add_form_params<K, V, I>(self, params: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        params
            .into_iter()
            .fold(self, |spec, (name, value)| spec.add_form_param(name, value))
    }

    pub fn add_multipart_text(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.push_part(
            name.into(),
            PartBody::Text {
                text: text.into(),
                charset: None,
            },
        )
    }

    pub fn add_multipart_text_with_charset(
        self,
        name: impl Into<String>,
        text: impl Into<String>,
        charset: &'static Encoding,
    ) -> Self {
        self.push_part(
            name.into(),
            PartBody::Text {
                text: text.into(),
                charset: Some(charset),
            },
        )
    }

    /// Binary part; the content type defaults to `application/octet-stream`
    /// and the filename to the part name.
    pub fn add_multipart_bytes(
        self,
        name: impl Into<String>,
        bytes: impl Into<Bytes>,
        content_type: Option<&str>,
        filename: Option<&str>,
    ) -> Self {
        self.push_part(
            name.into(),
            PartBody::Bytes {
                bytes: bytes.into(),
                content_type: content_type.map(ToOwned::to_owned),
                filename: filename.map(ToOwned::to_owned),
            },
        )
    }

    /// File part, read when the request is finalized.
    pub fn add_multipart_file(self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.push_part(name.into(), PartBody::File(path.into()))
    }

    fn push_part(mut self, name: String, body: PartBody) -> Self {
        self.entity.push_part(Part { name, body });
        self
    }

    pub fn basic_auth(self, username: &str, password: &str) -> Self {
        let encoded = basic_credentials(username, password);
        self.basic_auth_encoded(encoded)
    }

    /// Uses an already base64-encoded `user:password` token.
    pub fn basic_auth_encoded(self, token: impl AsRef<str>) -> Self {
        let value = format!("Basic {}", token.as_ref().trim());
        self.set_header(AUTHORIZATION.as_str(), value)
    }

    /// Target URL with the scheme completed and the query parameters appended.
    pub fn full_url(&self) -> String {
        let raw = self.url.trim();
        let lowered = raw.to_ascii_lowercase();
        let mut url = if lowered.starts_with("http://")
            || lowered.starts_with("https://")
            || raw.contains("://")
        {
            raw.to_owned()
        } else {
            format!("http://{raw}")
        };
        if self.params.is_empty() {
            return url;
        }

        let fragment = url.find('#').map(|index| url.split_off(index));
        if !url.contains('?') {
            url.push('?');
        } else if !url.ends_with('?') && !url.ends_with('&') {
            url.push('&');
        }
        let query = self
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", form_escape(name), form_escape(value)))
            .collect::<Vec<_>>()
            .join("&");
        url.push_str(&query);
        if let Some(fragment) = fragment {
            url.push_str(&fragment);
        }
        url
    }

    /// Validates the builder and produces the wire-ready request.
    pub async fn finalize(&self) -> Result<PreparedRequest, HttpClientError> {
        let url = self.full_url();
        let method = self.parse_method(&url)?;
        let uri = parse_request_uri(&url)?;

        if method == Method::TRACE && !self.entity.is_empty() {
            return Err(HttpClientError::MalformedRequest {
                method: self.method.clone(),
                uri: url,
                message: "TRACE requests cannot carry a body".to_owned(),
            });
        }

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 2);
        for (name, value) in &self.headers {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.append(header_name, header_value);
        }
        if !headers.contains_key(USER_AGENT) && !self.config.user_agent.is_empty() {
            headers.insert(
                USER_AGENT,
                parse_header_value(USER_AGENT.as_str(), &self.config.user_agent)?,
            );
        }

        let encoded = self.entity.encode(self.config.query_charset).await?;
        let content_type = match (&self.entity, &self.content_type) {
            (Entity::Multipart(_), _) => encoded.content_type,
            (_, Some(explicit)) => Some(explicit.clone()),
            (_, None) => encoded.content_type,
        };
        if let Some(content_type) = content_type {
            headers.insert(
                CONTENT_TYPE,
                parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
            );
        }

        Ok(PreparedRequest {
            method,
            url,
            uri,
            headers,
            body: encoded.body,
        })
    }

    fn parse_method(&self, url: &str) -> Result<Method, HttpClientError> {
        let malformed = |message: &str| HttpClientError::MalformedRequest {
            method: self.method.clone(),
            uri: url.to_owned(),
            message: message.to_owned(),
        };
        if self.method.is_empty() {
            return Err(malformed("method is empty"));
        }
        Method::from_bytes(self.method.as_bytes()).map_err(|_| malformed("invalid method token"))
    }
}

fn form_escape(text: &str) -> String {
    url::form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

fn parse_request_uri(url: &str) -> Result<Uri, HttpClientError> {
    let invalid = || HttpClientError::InvalidUri {
        uri: url.to_owned(),
    };
    let parsed = url::Url::parse(url).map_err(|_| invalid())?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(invalid());
    }
    let mut parsed = parsed;
    parsed.set_fragment(None);
    parsed.as_str().parse().map_err(|_| invalid())
}

/// A finalized request: validated method, absolute URI, headers and encoded body.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    method: Method,
    url: String,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl PreparedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL as assembled from the builder, before normalization.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
