use bytes::Bytes;
use serde::de::DeserializeOwned;

/// Character sets the decoder understands natively. Anything else falls back
/// to UTF-8 with lossy replacement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl Charset {
    /// Maps an HTTP charset token to a decoder; unrecognized names fall back
    /// to UTF-8.
    pub(crate) fn resolve(name: Option<&str>) -> Self {
        match name.map(str::to_ascii_lowercase).as_deref() {
            Some("iso-8859-1" | "latin1" | "latin-1" | "us-ascii" | "ascii") => Self::Latin1,
            _ => Self::Utf8,
        }
    }
}

/// Fully buffered response body plus the charset tag sniffed from the
/// `Content-Type` header. String and JSON views are derived lazily from the
/// bytes.
#[derive(Clone, Debug)]
pub struct Response {
    bytes: Bytes,
    charset: Charset,
}

impl Response {
    pub(crate) fn new(bytes: Bytes, charset: Charset) -> Self {
        Self { bytes, charset }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Overrides the sniffed charset, e.g. when a caller knows better from
    /// document content.
    pub fn set_charset(&mut self, charset: Charset) {
        self.charset = charset;
    }

    pub fn text(&self) -> String {
        match self.charset {
            Charset::Utf8 => String::from_utf8_lossy(&self.bytes).into_owned(),
            Charset::Latin1 => self.bytes.iter().map(|&byte| byte as char).collect(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }

    /// Decodes the body as an image, sniffing the format from the bytes.
    pub fn image(&self) -> Result<image::DynamicImage, image::ImageError> {
        image::load_from_memory(&self.bytes)
    }
}
