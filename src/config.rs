// --- Runtime configuration ------------------------------------------------
//
// Everything comes from environment variables, read once at startup:
//   IMAGE_API_BIND          full listen address (overrides PORT)
//   PORT                    listen port on 0.0.0.0 (default 4000)
//   IMAGE_API_MEDIA_DIR     image directory (default ./images)
//   IMAGE_API_ARCHIVE_DIR   where deleted images are moved (default ./images_removed)
//   IMAGE_API_PUBLIC_URL    base for the `url` field handed to clients
//   IMAGE_API_MAX_UPLOAD_MB upload body limit (default 25)

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_MAX_UPLOAD_MB: usize = 25;

// Characters that cannot appear raw inside a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub media_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub public_url: String,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind: SocketAddr = match get("IMAGE_API_BIND") {
            Some(addr) => addr
                .parse::<SocketAddr>()
                .with_context(|| format!("IMAGE_API_BIND is not a socket address: {addr}"))?,
            None => {
                let port = match get("PORT") {
                    Some(p) => p.parse::<u16>().with_context(|| format!("PORT is not a port number: {p}"))?,
                    None => DEFAULT_PORT,
                };
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let max_upload_bytes = match get("IMAGE_API_MAX_UPLOAD_MB") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("IMAGE_API_MAX_UPLOAD_MB is not a number: {v}"))?
                .checked_mul(1024 * 1024)
                .with_context(|| format!("IMAGE_API_MAX_UPLOAD_MB is too large: {v}"))?,
            None => DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
        };

        let public_url = get("IMAGE_API_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", bind.port()))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bind,
            media_dir: get("IMAGE_API_MEDIA_DIR").unwrap_or_else(|| "images".into()).into(),
            archive_dir: get("IMAGE_API_ARCHIVE_DIR").unwrap_or_else(|| "images_removed".into()).into(),
            public_url,
            max_upload_bytes,
        })
    }

    /// Public URL of an image served from the static `/images` route.
    pub fn image_url(&self, id: &str) -> String {
        format!("{}/images/{}", self.public_url, utf8_percent_encode(id, PATH_SEGMENT))
    }
}
