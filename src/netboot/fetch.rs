//! Scheme-dispatched clients for fetching the rootfs image.
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Url;

use super::tftp::{TftpClient, TftpError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no client registered for scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("request to {url} failed")]
    Http {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("TFTP transfer of {url} failed")]
    Tftp {
        url: Url,
        #[source]
        source: TftpError,
    },
    #[error("{0} does not name a file")]
    InvalidPath(Url),
    #[error("{0} did not report its size")]
    UnknownSize(Url),
}

pub trait SchemeClient {
    /// Size in bytes of the object at `url`.
    fn size(&self, url: &Url) -> Result<u64>;
    /// Streams the object at `url`.
    fn fetch(&self, url: &Url) -> Result<Box<dyn Read>>;
}

/// `file://` URLs.
#[derive(Debug, Default, Clone)]
pub struct FileClient;

impl FileClient {
    fn path(url: &Url) -> Result<PathBuf> {
        url.to_file_path()
            .map_err(|()| FetchError::InvalidPath(url.clone()))
    }
}

impl SchemeClient for FileClient {
    fn size(&self, url: &Url) -> Result<u64> {
        let path = Self::path(url)?;
        let metadata = fs::metadata(&path).map_err(|source| FetchError::Io { path, source })?;
        Ok(metadata.len())
    }

    fn fetch(&self, url: &Url) -> Result<Box<dyn Read>> {
        let path = Self::path(url)?;
        let file = File::open(&path).map_err(|source| FetchError::Io { path, source })?;
        Ok(Box::new(file))
    }
}

/// `http://` and `https://` URLs. The size comes from the `Content-Length` of
/// a `HEAD` request.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// A client for image downloads. Only connecting is bounded in time; a
    /// large image may take as long as it takes.
    pub fn download_client() -> reqwest::Result<Client> {
        Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
    }

    fn http_err(url: &Url) -> impl FnOnce(reqwest::Error) -> FetchError + '_ {
        move |source| FetchError::Http {
            url: url.clone(),
            source,
        }
    }
}

impl SchemeClient for HttpClient {
    fn size(&self, url: &Url) -> Result<u64> {
        let resp = self
            .client
            .head(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(Self::http_err(url))?;

        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| FetchError::UnknownSize(url.clone()))
    }

    fn fetch(&self, url: &Url) -> Result<Box<dyn Read>> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(Self::http_err(url))?;
        Ok(Box::new(resp))
    }
}

/// Clients keyed by URL scheme.
#[derive(Default)]
pub struct Schemes {
    clients: HashMap<String, Box<dyn SchemeClient>>,
}

impl Schemes {
    /// `file`, `http`, `https` and `tftp`.
    pub fn with_defaults() -> Self {
        let mut schemes = Schemes::default();
        match HttpClient::download_client() {
            Ok(client) => {
                let http = HttpClient::new(client);
                schemes.register("http", http.clone());
                schemes.register("https", http);
            }
            Err(e) => log::warn!("http client unavailable: {}", e),
        }
        schemes.register("file", FileClient);
        schemes.register("tftp", TftpClient::default());
        schemes
    }

    pub fn register<C: SchemeClient + 'static>(&mut self, scheme: &str, client: C) {
        self.clients
            .insert(scheme.to_ascii_lowercase(), Box::new(client));
    }

    fn client(&self, url: &Url) -> Result<&dyn SchemeClient> {
        self.clients
            .get(url.scheme())
            .map(|c| c.as_ref())
            .ok_or_else(|| FetchError::UnsupportedScheme(url.scheme().to_string()))
    }

    pub fn size(&self, url: &Url) -> Result<u64> {
        self.client(url)?.size(url)
    }

    pub fn fetch(&self, url: &Url) -> Result<Box<dyn Read>> {
        self.client(url)?.fetch(url)
    }
}
