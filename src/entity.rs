use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;

const MULTIPART_DASH_COUNT: usize = 27;
const MULTIPART_DIGIT_COUNT: usize = 11;
const CRLF: &[u8] = b"\r\n";

/// A named, sized, streamable source used as one multipart part. `open` must
/// return a fresh reader every call: entities are replayed on retries and
/// redirect retransmissions.
pub trait Openable: Send + Sync {
    fn file_name(&self) -> &str;
    fn mime_type(&self) -> &str;
    fn size(&self) -> u64;
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// [`Openable`] over a local file, with MIME type guessed from the extension.
pub struct FileOpenable {
    path: PathBuf,
    file_name: String,
    mime_type: &'static str,
    size: u64,
}

impl FileOpenable {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)?.len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = guess_mime_type(&file_name);
        Ok(Self {
            path,
            file_name,
            mime_type,
            size,
        })
    }
}

impl Openable for FileOpenable {
    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn mime_type(&self) -> &str {
        self.mime_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }
}

fn guess_mime_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// A request body able to report its exact byte length before streaming.
#[derive(Clone)]
pub enum Entity {
    Raw(RawEntity),
    UrlEncoded(UrlEncodedEntity),
    Multipart(MultipartEntity),
}

impl Entity {
    pub fn content_type(&self) -> String {
        match self {
            Self::Raw(entity) => entity.content_type.clone(),
            Self::UrlEncoded(_) => "application/x-www-form-urlencoded".to_owned(),
            Self::Multipart(entity) => {
                format!("multipart/form-data; boundary={}", entity.boundary)
            }
        }
    }

    /// Exact number of bytes `write_to` and the streaming reader will produce.
    pub fn content_length(&self) -> u64 {
        match self {
            Self::Raw(entity) => entity.bytes.len() as u64,
            Self::UrlEncoded(entity) => entity.encoded.len() as u64,
            Self::Multipart(entity) => entity
                .segments()
                .iter()
                .map(|segment| match segment {
                    Segment::Bytes(bytes) => bytes.len() as u64,
                    Segment::Stream(openable) => openable.size(),
                })
                .sum(),
        }
    }

    pub fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Raw(entity) => output.write_all(&entity.bytes),
            Self::UrlEncoded(entity) => output.write_all(entity.encoded.as_bytes()),
            Self::Multipart(entity) => {
                for segment in entity.segments() {
                    match segment {
                        Segment::Bytes(bytes) => output.write_all(&bytes)?,
                        Segment::Stream(openable) => {
                            let mut input = openable.open()?;
                            io::copy(&mut input, output)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Streaming view used by the transport; replayable because each call
    /// starts from the beginning (openable parts reopen their sources).
    pub(crate) fn reader(&self) -> EntityReader {
        let segments = match self {
            Self::Raw(entity) => vec![Segment::Bytes(entity.bytes.to_vec())],
            Self::UrlEncoded(entity) => vec![Segment::Bytes(entity.encoded.clone().into_bytes())],
            Self::Multipart(entity) => entity.segments(),
        };
        EntityReader {
            segments: segments.into(),
            current: None,
        }
    }
}

/// Caller-controlled bytes plus content type.
#[derive(Clone)]
pub struct RawEntity {
    bytes: Bytes,
    content_type: String,
}

impl RawEntity {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn from_text(text: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes(), content_type)
    }
}

impl From<RawEntity> for Entity {
    fn from(entity: RawEntity) -> Self {
        Self::Raw(entity)
    }
}

/// `application/x-www-form-urlencoded` body. The encoded form is maintained
/// incrementally, so appends are cheap and the length is always exact.
#[derive(Clone, Default)]
pub struct UrlEncodedEntity {
    encoded: String,
}

impl UrlEncodedEntity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: &str) -> &mut Self {
        let pair = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(name, value)
            .finish();
        if !self.encoded.is_empty() {
            self.encoded.push('&');
        }
        self.encoded.push_str(&pair);
        self
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.append(name, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

impl From<UrlEncodedEntity> for Entity {
    fn from(entity: UrlEncodedEntity) -> Self {
        Self::UrlEncoded(entity)
    }
}

#[derive(Clone)]
enum PartBody {
    Bytes(Bytes),
    Openable(Arc<dyn Openable>),
}

#[derive(Clone)]
struct Part {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    body: PartBody,
}

pub(crate) enum Segment {
    Bytes(Vec<u8>),
    Stream(Arc<dyn Openable>),
}

/// `multipart/form-data` body with a per-instance random boundary. Length
/// prediction and writing share one segment list, so the byte-exact
/// content-length invariant holds by construction.
#[derive(Clone)]
pub struct MultipartEntity {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartEntity {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let mut boundary = String::with_capacity(MULTIPART_DASH_COUNT + MULTIPART_DIGIT_COUNT);
        for _ in 0..MULTIPART_DASH_COUNT {
            boundary.push('-');
        }
        for _ in 0..MULTIPART_DIGIT_COUNT {
            boundary.push(char::from(b'0' + rng.random_range(0..10_u8)));
        }
        Self {
            boundary,
            parts: Vec::new(),
        }
    }

    pub fn add_text(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.parts.push(Part {
            name: name.into(),
            file_name: None,
            content_type: None,
            body: PartBody::Bytes(Bytes::from(value.into().into_bytes())),
        });
        self
    }

    pub fn add_openable(&mut self, name: impl Into<String>, openable: Arc<dyn Openable>) -> &mut Self {
        self.parts.push(Part {
            name: name.into(),
            file_name: Some(openable.file_name().to_owned()),
            content_type: Some(openable.mime_type().to_owned()),
            body: PartBody::Openable(openable),
        });
        self
    }

    pub fn add_file(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> io::Result<&mut Self> {
        let openable = Arc::new(FileOpenable::new(path)?);
        Ok(self.add_openable(name, openable))
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_text(name, value);
        self
    }

    pub fn with_openable(mut self, name: impl Into<String>, openable: Arc<dyn Openable>) -> Self {
        self.add_openable(name, openable);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut head = Vec::new();
        for part in &self.parts {
            head.extend_from_slice(b"--");
            head.extend_from_slice(self.boundary.as_bytes());
            head.extend_from_slice(CRLF);
            head.extend_from_slice(b"Content-Disposition: form-data; name=\"");
            head.extend_from_slice(part.name.as_bytes());
            head.push(b'"');
            if let Some(file_name) = &part.file_name {
                head.extend_from_slice(b"; filename=\"");
                head.extend_from_slice(file_name.as_bytes());
                head.push(b'"');
            }
            head.extend_from_slice(CRLF);
            if let Some(content_type) = &part.content_type {
                head.extend_from_slice(b"Content-Type: ");
                head.extend_from_slice(content_type.as_bytes());
                head.extend_from_slice(CRLF);
            }
            head.extend_from_slice(CRLF);
            match &part.body {
                PartBody::Bytes(bytes) => head.extend_from_slice(bytes),
                PartBody::Openable(openable) => {
                    segments.push(Segment::Bytes(std::mem::take(&mut head)));
                    segments.push(Segment::Stream(Arc::clone(openable)));
                }
            }
            head.extend_from_slice(CRLF);
        }
        head.extend_from_slice(b"--");
        head.extend_from_slice(self.boundary.as_bytes());
        head.extend_from_slice(b"--");
        head.extend_from_slice(CRLF);
        segments.push(Segment::Bytes(head));
        segments
    }
}

impl From<MultipartEntity> for Entity {
    fn from(entity: MultipartEntity) -> Self {
        Self::Multipart(entity)
    }
}

/// Sequential reader over an entity's segments; openable segments are opened
/// lazily, one at a time.
pub(crate) struct EntityReader {
    segments: VecDeque<Segment>,
    current: Option<Box<dyn Read + Send>>,
}

impl Read for EntityReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.segments.pop_front() {
                    Some(Segment::Bytes(bytes)) => {
                        self.current = Some(Box::new(io::Cursor::new(bytes)));
                    }
                    Some(Segment::Stream(openable)) => {
                        self.current = Some(openable.open()?);
                    }
                    None => return Ok(0),
                }
            }
            let reader = self.current.as_mut().expect("current segment reader");
            let count = reader.read(buffer)?;
            if count > 0 {
                return Ok(count);
            }
            self.current = None;
        }
    }
}
