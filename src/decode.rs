//! HTTP content decoding and classification.
//!
//! Given raw body bytes plus Content-Type/Content-Encoding headers:
//! decompress, detect the real type (declared MIME first, magic bytes when
//! undeclared), decide text vs binary, decode text lossily, and parse
//! structured forms (JSON, form-urlencoded, multipart, HTML highlights).
//! Binary content gets a hex preview and best-effort image dimensions.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

/// Text cap: larger decoded bodies are treated as binary.
pub const MAX_TEXT_SIZE: usize = 1024 * 1024;

/// Bytes shown in hex previews.
const PREVIEW_BYTES: usize = 64;

/// Recognized content kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Json,
    Html,
    Xml,
    Plain,
    FormUrlencoded,
    FormMultipart,
    Javascript,
    Css,
    Image,
    Video,
    Audio,
    Pdf,
    Binary,
    Unknown,
}

/// Decoded body attached to a flow before the event is emitted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecodedContent {
    pub kind: ContentKind,
    pub mime_type: String,
    /// Character set the text was decoded with.
    pub encoding: String,
    pub raw_size: usize,
    pub decoded_size: usize,
    pub is_binary: bool,
    pub is_compressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Parsed JSON value, form multimap, multipart parts, or HTML info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub metadata: Map<String, Value>,
}

/// Magic-byte signatures checked when no MIME type is declared.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
    (b"RIFF", "audio/wav"),
    (b"\x00\x00\x00\x1c", "video/mp4"),
    (b"\x00\x00\x00\x18", "video/mp4"),
    (b"\x00\x00\x00\x20", "video/mp4"),
];

pub struct ContentDecoder {
    max_text_size: usize,
}

impl Default for ContentDecoder {
    fn default() -> Self {
        Self {
            max_text_size: MAX_TEXT_SIZE,
        }
    }
}

impl ContentDecoder {
    pub fn new(max_text_size: usize) -> Self {
        Self { max_text_size }
    }

    /// Decode one body.
    pub fn decode(
        &self,
        content: &[u8],
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> DecodedContent {
        let raw_size = content.len();

        // 1. Decompress. Failure keeps the raw bytes, marked binary.
        let (content, is_compressed) = match decompress(content, content_encoding) {
            Ok(pair) => pair,
            Err(e) => {
                return DecodedContent {
                    kind: ContentKind::Unknown,
                    mime_type: content_type.unwrap_or("unknown").to_string(),
                    encoding: "unknown".to_string(),
                    raw_size,
                    decoded_size: raw_size,
                    is_binary: true,
                    is_compressed: true,
                    text: None,
                    structured: None,
                    binary_preview: Some(hex_preview(content)),
                    error: Some(format!("decompression: {e}")),
                    metadata: Map::new(),
                };
            }
        };
        let decoded_size = content.len();

        // 2. Detect type.
        let (kind, mime_type) = detect_type(&content, content_type);

        // 3. Text or binary.
        let is_binary = matches!(
            kind,
            ContentKind::Image
                | ContentKind::Video
                | ContentKind::Audio
                | ContentKind::Pdf
                | ContentKind::Binary
        ) || decoded_size > self.max_text_size
            || !looks_like_text(&content);

        // 4. Charset.
        let charset = detect_charset(&content, content_type);

        if is_binary {
            let mut metadata = Map::new();
            metadata.insert("size_bytes".to_string(), json!(decoded_size));
            if kind == ContentKind::Image {
                if let Some((format, dims)) = image_info(&content) {
                    metadata.insert("format".to_string(), json!(format));
                    if let Some((w, h)) = dims {
                        metadata.insert("dimensions".to_string(), json!(format!("{w}x{h}")));
                    }
                }
            }
            return DecodedContent {
                kind,
                mime_type,
                encoding: charset,
                raw_size,
                decoded_size,
                is_binary: true,
                is_compressed,
                text: None,
                structured: None,
                binary_preview: Some(hex_preview(&content)),
                error: None,
                metadata,
            };
        }

        // 5. Decode text (lossy-replace, never failing) and parse structure.
        let text = decode_text(&content, &charset);
        let structured = match kind {
            ContentKind::Json => serde_json::from_str::<Value>(&text).ok(),
            ContentKind::FormUrlencoded => Some(parse_form_urlencoded(&text)),
            ContentKind::FormMultipart => {
                content_type.map(|ct| parse_multipart(&content, ct))
            }
            ContentKind::Html => Some(extract_html_info(&text)),
            _ => None,
        };

        DecodedContent {
            kind,
            mime_type,
            encoding: charset,
            raw_size,
            decoded_size,
            is_binary: false,
            is_compressed,
            text: Some(text),
            structured,
            binary_preview: None,
            error: None,
            metadata: Map::new(),
        }
    }
}

/// Decompress by Content-Encoding. `identity`/unknown pass through.
fn decompress(content: &[u8], encoding: Option<&str>) -> std::io::Result<(Vec<u8>, bool)> {
    let encoding = encoding.unwrap_or("").trim().to_ascii_lowercase();
    match encoding.as_str() {
        "gzip" => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(content).read_to_end(&mut out)?;
            Ok((out, true))
        }
        "deflate" => {
            // Raw deflate first, then zlib-wrapped.
            let mut out = Vec::new();
            match flate2::read::DeflateDecoder::new(content).read_to_end(&mut out) {
                Ok(_) => Ok((out, true)),
                Err(_) => {
                    let mut out = Vec::new();
                    flate2::read::ZlibDecoder::new(content).read_to_end(&mut out)?;
                    Ok((out, true))
                }
            }
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(content, 4096).read_to_end(&mut out)?;
            Ok((out, true))
        }
        _ => Ok((content.to_vec(), false)),
    }
}

fn detect_type(content: &[u8], content_type: Option<&str>) -> (ContentKind, String) {
    if let Some(header) = content_type {
        let mime = header
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !mime.is_empty() {
            let kind = if mime.contains("json") {
                ContentKind::Json
            } else if mime.contains("html") {
                ContentKind::Html
            } else if mime.contains("xml") {
                ContentKind::Xml
            } else if mime == "application/x-www-form-urlencoded" {
                ContentKind::FormUrlencoded
            } else if mime.contains("multipart/form-data") {
                ContentKind::FormMultipart
            } else if mime.contains("javascript") {
                ContentKind::Javascript
            } else if mime.contains("css") {
                ContentKind::Css
            } else if mime.starts_with("image/") {
                ContentKind::Image
            } else if mime.starts_with("video/") {
                ContentKind::Video
            } else if mime.starts_with("audio/") {
                ContentKind::Audio
            } else if mime == "application/pdf" {
                ContentKind::Pdf
            } else if mime.starts_with("text/") {
                ContentKind::Plain
            } else if mime == "application/octet-stream" {
                ContentKind::Binary
            } else {
                ContentKind::Unknown
            };
            if kind != ContentKind::Unknown {
                return (kind, mime);
            }
        }
    }

    // No usable declaration: magic bytes, then a text sniff.
    for (signature, mime) in SIGNATURES {
        if content.starts_with(signature) {
            let kind = if mime.starts_with("image/") {
                ContentKind::Image
            } else if mime.starts_with("video/") {
                ContentKind::Video
            } else if mime.starts_with("audio/") {
                ContentKind::Audio
            } else if *mime == "application/pdf" {
                ContentKind::Pdf
            } else {
                ContentKind::Binary
            };
            return (kind, mime.to_string());
        }
    }
    if looks_like_text(&content[..content.len().min(1024)]) {
        return (ContentKind::Plain, "text/plain".to_string());
    }
    (
        ContentKind::Binary,
        content_type.unwrap_or("application/octet-stream").to_string(),
    )
}

/// Text heuristic over the first KiB: no NUL bytes, and at most 15% of the
/// decoded characters non-printable.
fn looks_like_text(content: &[u8]) -> bool {
    if content.is_empty() {
        return true;
    }
    let head = &content[..content.len().min(1024)];
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(text) => {
            let total = text.chars().count();
            let printable = text
                .chars()
                .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
                .count();
            printable * 100 >= total * 85
        }
        Err(_) => false,
    }
}

fn detect_charset(content: &[u8], content_type: Option<&str>) -> String {
    if let Some(header) = content_type {
        let lower = header.to_ascii_lowercase();
        if let Some(idx) = lower.find("charset=") {
            let rest = &header[idx + "charset=".len()..];
            let cs: String = rest
                .chars()
                .take_while(|c| !matches!(c, ';' | ' ' | '"' | '\''))
                .collect();
            if !cs.is_empty() {
                return cs.to_ascii_lowercase();
            }
        }
    }
    if content.starts_with(b"\xef\xbb\xbf") {
        return "utf-8".to_string();
    }
    if content.starts_with(b"\xff\xfe") {
        return "utf-16-le".to_string();
    }
    if content.starts_with(b"\xfe\xff") {
        return "utf-16-be".to_string();
    }
    // HTML meta tag in the first 2 KiB.
    let head = String::from_utf8_lossy(&content[..content.len().min(2048)]).to_ascii_lowercase();
    if let Some(idx) = head.find("charset=") {
        let rest = &head[idx + "charset=".len()..];
        let cs: String = rest
            .trim_start_matches(['"', '\''])
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if !cs.is_empty() {
            return cs;
        }
    }
    "utf-8".to_string()
}

/// Lossy text decode. UTF-8 and latin-1 are handled directly; anything else
/// falls back to lossy UTF-8.
fn decode_text(content: &[u8], charset: &str) -> String {
    match charset {
        "iso-8859-1" | "latin-1" | "latin1" | "windows-1252" => {
            content.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(content).into_owned(),
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `a=1&a=2&b=x` into a multimap, percent-decoded.
pub fn parse_form_urlencoded(text: &str) -> Value {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in text.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.entry(percent_decode(key))
            .or_default()
            .push(percent_decode(value));
    }
    json!(map)
}

/// Parse multipart/form-data into parts: text fields get their value, file
/// fields get size and a hex preview.
pub fn parse_multipart(content: &[u8], content_type: &str) -> Value {
    let mut parts = Vec::new();
    let Some(boundary) = content_type
        .split(';')
        .filter_map(|p| p.trim().strip_prefix("boundary="))
        .next()
        .map(|b| b.trim_matches('"'))
    else {
        return json!(parts);
    };
    let delim = format!("--{boundary}");

    for section in split_bytes(content, delim.as_bytes()).into_iter().skip(1) {
        let trimmed = trim_bytes(section);
        if trimmed.is_empty() || trimmed == b"--" {
            continue;
        }
        let Some(header_end) = find_bytes(section, b"\r\n\r\n") else {
            continue;
        };
        let header_raw = &section[..header_end];
        let body = trim_crlf(&section[header_end + 4..]);

        let mut headers = BTreeMap::new();
        for line in String::from_utf8_lossy(header_raw).lines() {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(
                    name.trim().to_ascii_lowercase(),
                    value.trim().to_string(),
                );
            }
        }

        let disposition = headers.get("content-disposition").cloned().unwrap_or_default();
        let name = disposition_param(&disposition, "name");
        let filename = disposition_param(&disposition, "filename");

        let mut part = Map::new();
        part.insert("name".to_string(), json!(name));
        part.insert("headers".to_string(), json!(headers));
        match filename {
            Some(filename) => {
                part.insert("filename".to_string(), json!(filename));
                part.insert("size".to_string(), json!(body.len()));
                part.insert("preview".to_string(), json!(hex_preview(body)));
            }
            None => {
                part.insert(
                    "value".to_string(),
                    json!(String::from_utf8_lossy(body).into_owned()),
                );
            }
        }
        parts.push(Value::Object(part));
    }
    json!(parts)
}

fn disposition_param(disposition: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let start = disposition.find(&marker)? + marker.len();
    let rest = &disposition[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn split_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut start = 0;
    while let Some(idx) = find_bytes(&haystack[start..], needle) {
        sections.push(&haystack[start..start + idx]);
        start += idx + needle.len();
    }
    sections.push(&haystack[start..]);
    sections
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim_bytes(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn trim_crlf(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end >= 2 && &bytes[end - 2..end] == b"\r\n" {
        end -= 2;
    }
    &bytes[..end]
}

/// Pull title, meta description, form actions, and password-field presence
/// out of an HTML document.
pub fn extract_html_info(html: &str) -> Value {
    static TITLE: OnceLock<regex::Regex> = OnceLock::new();
    static DESC: OnceLock<regex::Regex> = OnceLock::new();
    static FORM_ACTION: OnceLock<regex::Regex> = OnceLock::new();
    static PASSWORD: OnceLock<regex::Regex> = OnceLock::new();

    let title_re =
        TITLE.get_or_init(|| regex::Regex::new(r"(?i)<title[^>]*>([^<]+)</title>").unwrap());
    let desc_re = DESC.get_or_init(|| {
        regex::Regex::new(r#"(?i)<meta[^>]+name=["']description["'][^>]+content=["']([^"']+)"#)
            .unwrap()
    });
    let action_re = FORM_ACTION
        .get_or_init(|| regex::Regex::new(r#"(?i)<form[^>]+action=["']([^"']+)"#).unwrap());
    let password_re =
        PASSWORD.get_or_init(|| regex::Regex::new(r#"(?i)type=["']password["']"#).unwrap());

    let mut info = Map::new();
    if let Some(c) = title_re.captures(html) {
        info.insert("title".to_string(), json!(c[1].trim()));
    }
    if let Some(c) = desc_re.captures(html) {
        info.insert("description".to_string(), json!(c[1].trim()));
    }
    let actions: Vec<String> = action_re
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect();
    if !actions.is_empty() {
        info.insert("form_actions".to_string(), json!(actions));
    }
    if password_re.is_match(html) {
        info.insert("has_password_field".to_string(), json!(true));
    }
    Value::Object(info)
}

/// Space-separated hex of the first 64 bytes, with a total-size suffix when
/// truncated.
pub fn hex_preview(content: &[u8]) -> String {
    let preview = &content[..content.len().min(PREVIEW_BYTES)];
    let mut out = preview
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    if content.len() > PREVIEW_BYTES {
        out.push_str(&format!(" ... ({} bytes total)", content.len()));
    }
    out
}

/// Image format and dimensions for PNG/JPEG/GIF.
fn image_info(content: &[u8]) -> Option<(&'static str, Option<(u32, u32)>)> {
    if content.starts_with(b"\x89PNG") {
        let dims = (content.len() > 24).then(|| {
            let w = u32::from_be_bytes([content[16], content[17], content[18], content[19]]);
            let h = u32::from_be_bytes([content[20], content[21], content[22], content[23]]);
            (w, h)
        });
        return Some(("PNG", dims));
    }
    if content.starts_with(b"\xff\xd8\xff") {
        // Walk JPEG segments to a SOF marker.
        let mut i = 2;
        while i + 9 < content.len() {
            if content[i] == 0xff {
                let marker = content[i + 1];
                if matches!(marker, 0xc0 | 0xc1 | 0xc2) {
                    let h = u16::from_be_bytes([content[i + 5], content[i + 6]]) as u32;
                    let w = u16::from_be_bytes([content[i + 7], content[i + 8]]) as u32;
                    return Some(("JPEG", Some((w, h))));
                }
                let len = u16::from_be_bytes([content[i + 2], content[i + 3]]) as usize;
                i += 2 + len;
            } else {
                i += 1;
            }
        }
        return Some(("JPEG", None));
    }
    if content.starts_with(b"GIF") {
        let dims = (content.len() > 10).then(|| {
            let w = u16::from_le_bytes([content[6], content[7]]) as u32;
            let h = u16::from_le_bytes([content[8], content[9]]) as u32;
            (w, h)
        });
        return Some(("GIF", dims));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_gzip_decode_roundtrip() {
        let body = br#"{"user":"kid","score":42}"#;
        let compressed = gzip(body);
        let decoder = ContentDecoder::default();
        let decoded = decoder.decode(&compressed, Some("application/json"), Some("gzip"));
        assert!(decoded.is_compressed);
        assert!(!decoded.is_binary);
        assert_eq!(decoded.kind, ContentKind::Json);
        assert!(decoded.raw_size < decoded.decoded_size || body.len() < 64);
        assert_eq!(decoded.structured.as_ref().unwrap()["user"], "kid");
    }

    #[test]
    fn test_decompression_failure_keeps_raw() {
        let decoder = ContentDecoder::default();
        let decoded = decoder.decode(b"definitely not gzip", None, Some("gzip"));
        assert!(decoded.error.as_deref().unwrap().starts_with("decompression"));
        assert!(decoded.is_binary);
        assert!(decoded.binary_preview.is_some());
    }

    #[test]
    fn test_json_structured_roundtrip() {
        let decoder = ContentDecoder::default();
        let obj = json!({"a": [1, 2, 3], "b": {"nested": true}});
        let encoded = serde_json::to_vec(&obj).unwrap();
        let decoded = decoder.decode(&encoded, Some("application/json"), None);
        assert_eq!(decoded.structured.unwrap(), obj);
    }

    #[test]
    fn test_form_urlencoded_multimap() {
        let decoded = parse_form_urlencoded("a=1&a=2&msg=hello+world&empty=");
        assert_eq!(decoded["a"], json!(["1", "2"]));
        assert_eq!(decoded["msg"], json!(["hello world"]));
        assert_eq!(decoded["empty"], json!([""]));
    }

    #[test]
    fn test_form_urlencoded_percent_decoding() {
        let decoded = parse_form_urlencoded("q=50%25+off&path=%2Fhome");
        assert_eq!(decoded["q"], json!(["50% off"]));
        assert_eq!(decoded["path"], json!(["/home"]));
    }

    #[test]
    fn test_multipart_parts() {
        let body = b"--XBOUND\r\n\
Content-Disposition: form-data; name=\"user\"\r\n\r\n\
alice\r\n\
--XBOUND\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"x.bin\"\r\n\
Content-Type: application/octet-stream\r\n\r\n\
\x00\x01\x02\x03\r\n\
--XBOUND--\r\n";
        let parts = parse_multipart(body, "multipart/form-data; boundary=XBOUND");
        let parts = parts.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["name"], "user");
        assert_eq!(parts[0]["value"], "alice");
        assert_eq!(parts[1]["filename"], "x.bin");
        assert_eq!(parts[1]["size"], 4);
        assert_eq!(parts[1]["preview"], "00 01 02 03");
    }

    #[test]
    fn test_magic_byte_detection_without_mime() {
        let decoder = ContentDecoder::default();
        let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x01\x00\x00\x00\x00\x80rest";
        let decoded = decoder.decode(png, None, None);
        assert_eq!(decoded.kind, ContentKind::Image);
        assert_eq!(decoded.mime_type, "image/png");
        assert!(decoded.is_binary);
        assert_eq!(decoded.metadata["dimensions"], "256x128");
    }

    #[test]
    fn test_declared_mime_wins_over_sniffing() {
        let decoder = ContentDecoder::default();
        let decoded = decoder.decode(b"<html><title>t</title></html>", Some("text/html"), None);
        assert_eq!(decoded.kind, ContentKind::Html);
        assert_eq!(decoded.structured.unwrap()["title"], "t");
    }

    #[test]
    fn test_binary_heuristic_nul_bytes() {
        let decoder = ContentDecoder::default();
        let decoded = decoder.decode(b"text\x00with\x00nuls", None, None);
        assert!(decoded.is_binary);
    }

    #[test]
    fn test_size_cap_forces_binary() {
        let decoder = ContentDecoder::new(16);
        let decoded = decoder.decode(b"this is longer than sixteen bytes", Some("text/plain"), None);
        assert!(decoded.is_binary);
    }

    #[test]
    fn test_charset_from_header_and_meta() {
        assert_eq!(
            detect_charset(b"", Some("text/html; charset=ISO-8859-1")),
            "iso-8859-1"
        );
        assert_eq!(
            detect_charset(b"<meta charset=\"windows-1252\">", None),
            "windows-1252"
        );
        assert_eq!(detect_charset(b"plain", None), "utf-8");
    }

    #[test]
    fn test_html_extraction() {
        let html = r#"<html><head><title> Login </title>
            <meta name="description" content="Sign in page"></head>
            <body><form action="/login"><input type="password" name="p"></form></body></html>"#;
        let info = extract_html_info(html);
        assert_eq!(info["title"], "Login");
        assert_eq!(info["description"], "Sign in page");
        assert_eq!(info["form_actions"], json!(["/login"]));
        assert_eq!(info["has_password_field"], true);
    }

    #[test]
    fn test_hex_preview_truncation() {
        let data = vec![0xabu8; 100];
        let preview = hex_preview(&data);
        assert!(preview.starts_with("ab ab"));
        assert!(preview.ends_with("(100 bytes total)"));
    }

    #[test]
    fn test_brotli_decode() {
        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(b"hello brotli world").unwrap();
        }
        let decoder = ContentDecoder::default();
        let decoded = decoder.decode(&compressed, Some("text/plain"), Some("br"));
        assert_eq!(decoded.text.as_deref(), Some("hello brotli world"));
    }

    #[test]
    fn test_gif_dimensions() {
        let gif = b"GIF89a\x40\x01\xf0\x00rest-of-gif";
        let (format, dims) = image_info(gif).unwrap();
        assert_eq!(format, "GIF");
        assert_eq!(dims, Some((320, 240)));
    }
}
