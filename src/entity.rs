use std::borrow::Cow;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use encoding_rs::Encoding;

use crate::error::HttpClientError;

pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
pub(crate) const TEXT_PLAIN: &str = "text/plain";
pub(crate) const APPLICATION_JSON: &str = "application/json";
pub(crate) const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Clone, Debug)]
pub(crate) enum PartBody {
    Text {
        text: String,
        charset: Option<&'static Encoding>,
    },
    Bytes {
        bytes: Bytes,
        content_type: Option<String>,
        filename: Option<String>,
    },
    File(PathBuf),
}

#[derive(Clone, Debug)]
pub(crate) struct Part {
    pub(crate) name: String,
    pub(crate) body: PartBody,
}

/// Body of a request; exactly one kind is active at a time.
#[derive(Clone, Debug, Default)]
pub(crate) enum Entity {
    #[default]
    Empty,
    Bytes(Bytes),
    Text {
        body: Bytes,
        mime: &'static str,
        charset: &'static Encoding,
    },
    Form(Vec<(String, String)>),
    Multipart(Vec<Part>),
}

pub(crate) struct EncodedEntity {
    pub(crate) body: Bytes,
    pub(crate) content_type: Option<String>,
}

impl Entity {
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub(crate) fn text(text: &str, mime: &'static str, charset: &'static Encoding) -> Self {
        Self::Text {
            body: Bytes::from(encode_text(text, charset).into_owned()),
            mime,
            charset,
        }
    }

    pub(crate) fn push_form_param(&mut self, name: String, value: String) {
        match self {
            Self::Form(params) => params.push((name, value)),
            other => *other = Self::Form(vec![(name, value)]),
        }
    }

    pub(crate) fn push_part(&mut self, part: Part) {
        match self {
            Self::Multipart(parts) => parts.push(part),
            other => *other = Self::Multipart(vec![part]),
        }
    }

    /// Serializes the body; multipart file parts are read here.
    pub(crate) async fn encode(
        &self,
        charset: &'static Encoding,
    ) -> Result<EncodedEntity, HttpClientError> {
        match self {
            Self::Empty => Ok(EncodedEntity {
                body: Bytes::new(),
                content_type: None,
            }),
            Self::Bytes(bytes) => Ok(EncodedEntity {
                body: bytes.clone(),
                content_type: Some(OCTET_STREAM.to_owned()),
            }),
            Self::Text {
                body,
                mime,
                charset,
            } => Ok(EncodedEntity {
                body: body.clone(),
                content_type: Some(with_charset(mime, charset)),
            }),
            Self::Form(params) => Ok(EncodedEntity {
                body: Bytes::from(encode_form(params, charset)),
                content_type: Some(with_charset(FORM_URLENCODED, charset)),
            }),
            Self::Multipart(parts) => {
                let boundary = new_boundary();
                let body = encode_multipart(parts, &boundary, charset).await?;
                Ok(EncodedEntity {
                    body,
                    content_type: Some(format!("multipart/form-data; boundary={boundary}")),
                })
            }
        }
    }
}

pub(crate) fn with_charset(mime: &str, charset: &'static Encoding) -> String {
    format!("{mime}; charset={}", charset.name())
}

pub(crate) fn encode_text<'a>(text: &'a str, charset: &'static Encoding) -> Cow<'a, [u8]> {
    let (bytes, _, _) = charset.encode(text);
    bytes
}

pub(crate) fn encode_form(params: &[(String, String)], charset: &'static Encoding) -> String {
    let encode: &dyn Fn(&str) -> Cow<'_, [u8]> = &|text| encode_text(text, charset);
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.encoding_override(Some(encode));
    for (name, value) in params {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

fn new_boundary() -> String {
    format!(
        "----pooled-http-{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}

fn escape_quoted(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

async fn encode_multipart(
    parts: &[Part],
    boundary: &str,
    charset: &'static Encoding,
) -> Result<Bytes, HttpClientError> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let name = escape_quoted(&part.name);
        match &part.body {
            PartBody::Text {
                text,
                charset: part_charset,
            } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(&encode_text(text, part_charset.unwrap_or(charset)));
            }
            PartBody::Bytes {
                bytes,
                content_type,
                filename,
            } => {
                let filename = filename.as_deref().unwrap_or(&part.name);
                write_binary_headers(
                    &mut body,
                    &name,
                    filename,
                    content_type.as_deref().unwrap_or(OCTET_STREAM),
                    charset,
                );
                body.extend_from_slice(bytes);
            }
            PartBody::File(path) => {
                let contents =
                    tokio::fs::read(path)
                        .await
                        .map_err(|source| HttpClientError::ReadFile {
                            path: path.display().to_string(),
                            source,
                        })?;
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| part.name.clone());
                write_binary_headers(&mut body, &name, &filename, OCTET_STREAM, charset);
                body.extend_from_slice(&contents);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(Bytes::from(body))
}

fn write_binary_headers(
    body: &mut Vec<u8>,
    name: &str,
    filename: &str,
    content_type: &str,
    charset: &'static Encoding,
) {
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"").as_bytes(),
    );
    body.extend_from_slice(&encode_text(&escape_quoted(filename), charset));
    body.extend_from_slice(format!("\"\r\nContent-Type: {content_type}\r\n\r\n").as_bytes());
}

/// `Basic` credentials with the Latin-1 byte mapping; characters outside it become `?`.
pub(crate) fn basic_credentials(username: &str, password: &str) -> String {
    let latin1: Vec<u8> = username
        .chars()
        .chain(std::iter::once(':'))
        .chain(password.chars())
        .map(|ch| u8::try_from(u32::from(ch)).unwrap_or(b'?'))
        .collect();
    STANDARD.encode(latin1)
}
