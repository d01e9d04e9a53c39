//! Minimal HTTP/1.1 transport for the classifier.
//!
//! - `GET /health`: static liveness, independent of model state.
//! - `POST /detect`: multipart upload (`image` file, optional `mode` field),
//!   or a raw `image/*` body with `?mode=`.
//! - `OPTIONS *`: permissive CORS preflight.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::service::Classifier;

const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            max_body_bytes: crate::frame::MAX_COMPRESSED_BYTES + 64 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    classifier: Arc<Classifier>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, classifier: Arc<Classifier>) -> Self {
        Self { cfg, classifier }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let classifier = self.classifier;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, classifier, shutdown_thread) {
                log::error!("detect api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    classifier: Arc<Classifier>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let classifier = classifier.clone();
                let cfg = cfg.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &classifier, &cfg) {
                        log::warn!("detect api request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, classifier: &Classifier, cfg: &ApiConfig) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_json_response(&mut stream, 413, r#"{"error":"payload_too_large"}"#)?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => write_response(&mut stream, 204, "text/plain", b""),
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("POST", "/detect") => {
            let upload = match request.upload() {
                Ok(upload) => upload,
                Err(err) => {
                    write_json_response(&mut stream, 422, r#"{"error":"missing_image"}"#)?;
                    return Err(err);
                }
            };
            let outcome = classifier.classify(&upload.image, upload.mode.as_deref());
            log::info!(
                "detect mode={} bytes={} -> {}",
                upload.mode.as_deref().unwrap_or(classifier.default_mode()),
                upload.image.len(),
                outcome
                    .reason()
                    .map(|r| r.as_str())
                    .unwrap_or("success")
            );
            let payload = serde_json::to_vec(&outcome.to_response())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        (_, "/health") | (_, "/detect") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

#[derive(Debug)]
enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

fn read_request(stream: &mut TcpStream, max_body_bytes: usize) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find(&data, b"\r\n\r\n", 0) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::TooLarge);
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("connection closed before headers")));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("invalid content-length")))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(RequestError::TooLarge);
    }

    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("body shorter than content-length")));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: *\r\nAccess-Control-Allow-Headers: *\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

#[derive(Debug, PartialEq)]
struct Upload {
    image: Vec<u8>,
    mode: Option<String>,
}

impl HttpRequest {
    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.raw_path.split('?').nth(1)?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name && !v.is_empty()).then(|| v.to_string())
        })
    }

    /// Extract the uploaded image and inference mode.
    fn upload(&self) -> Result<Upload> {
        let content_type = self
            .headers
            .get("content-type")
            .map(String::as_str)
            .unwrap_or("");
        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            let boundary = multipart_boundary(content_type)
                .ok_or_else(|| anyhow!("multipart request without boundary"))?;
            let parts = parse_multipart(&self.body, &boundary)?;
            let mut image = None;
            let mut mode = self.query_param("mode");
            for part in parts {
                match part.name.as_str() {
                    "image" => image = Some(part.data),
                    "mode" => {
                        let value = String::from_utf8_lossy(&part.data).trim().to_string();
                        if !value.is_empty() {
                            mode = Some(value);
                        }
                    }
                    _ => {}
                }
            }
            let image = image.ok_or_else(|| anyhow!("multipart request has no 'image' part"))?;
            return Ok(Upload { image, mode });
        }

        if self.body.is_empty() {
            return Err(anyhow!("request body is empty"));
        }
        Ok(Upload {
            image: self.body.clone(),
            mode: self.query_param("mode"),
        })
    }
}

#[derive(Debug)]
struct FormPart {
    name: String,
    data: Vec<u8>,
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<FormPart>> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut pos = find(body, delimiter, 0).ok_or_else(|| anyhow!("multipart boundary not found"))?;
    let mut parts = Vec::new();
    loop {
        let start = pos + delimiter.len();
        let rest = body
            .get(start..)
            .ok_or_else(|| anyhow!("truncated multipart body"))?;
        if rest.starts_with(b"--") {
            break;
        }
        let start = start + 2; // CRLF after the delimiter
        let next = find(body, delimiter, start).ok_or_else(|| anyhow!("unterminated multipart body"))?;
        let section = body
            .get(start..next)
            .ok_or_else(|| anyhow!("malformed multipart section"))?;
        let split = find(section, b"\r\n\r\n", 0)
            .ok_or_else(|| anyhow!("multipart part without headers"))?;
        let headers = String::from_utf8_lossy(&section[..split]);
        let mut data = &section[split + 4..];
        if data.ends_with(b"\r\n") {
            data = &data[..data.len() - 2];
        }
        let name = headers
            .split("\r\n")
            .find(|h| h.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|h| disposition_param(h, "name"))
            .unwrap_or_default();
        parts.push(FormPart {
            name,
            data: data.to_vec(),
        });
        pos = next;
    }
    Ok(parts)
}

fn disposition_param(header: &str, key: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
