use std::io::{Read, Write};
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};

const USER_AGENT: &str = concat!("fishforge/", env!("CARGO_PKG_VERSION"));
const CHUNK: usize = 64 * 1024;

/// Byte-count callback for download progress: `(received, total_if_known)`.
pub type TransferProgress<'a> = &'a mut dyn FnMut(u64, Option<u64>);

/// Network access used by acquisition and provisioning; swapped for fakes in tests.
pub trait HttpFetch: Send + Sync {
    fn get_json(&self, url: &str, cancel: &CancelToken) -> Result<serde_json::Value>;

    /// Stream `url` into `sink`, failing with `TooLarge` once more than `limit` bytes arrive.
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        limit: u64,
        cancel: &CancelToken,
        progress: TransferProgress<'_>,
    ) -> Result<u64>;
}

/// Copy a body into `sink` in chunks, enforcing the ceiling and checking cancellation.
pub fn copy_limited(
    body: &mut dyn Read,
    sink: &mut dyn Write,
    limit: u64,
    total: Option<u64>,
    cancel: &CancelToken,
    progress: TransferProgress<'_>,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut received = 0u64;
    loop {
        cancel.check()?;
        let n = body
            .read(&mut buf)
            .map_err(|e| Error::new(ErrorKind::Network, format!("body read failed: {e}")))?;
        if n == 0 {
            break;
        }
        received += n as u64;
        if received > limit {
            return Err(too_large(limit));
        }
        sink.write_all(&buf[..n])?;
        progress(received, total);
    }
    sink.flush()?;
    Ok(received)
}

pub fn too_large(limit: u64) -> Error {
    Error::new(
        ErrorKind::TooLarge,
        format!("download too large (limit {limit} bytes)"),
    )
}

pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                Error::new(ErrorKind::Network, format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let res = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::new(ErrorKind::Network, format!("GET {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::new(
                ErrorKind::Network,
                format!("GET {url} failed with status {}", res.status()),
            ));
        }
        Ok(res)
    }
}

impl HttpFetch for ReqwestFetcher {
    fn get_json(&self, url: &str, cancel: &CancelToken) -> Result<serde_json::Value> {
        cancel.check()?;
        let res = self.get(url)?;
        res.json::<serde_json::Value>()
            .map_err(|e| Error::new(ErrorKind::Network, format!("invalid JSON from {url}: {e}")))
    }

    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        limit: u64,
        cancel: &CancelToken,
        progress: TransferProgress<'_>,
    ) -> Result<u64> {
        cancel.check()?;
        let mut res = self.get(url)?;
        let total = res.content_length();
        if let Some(len) = total
            && len > limit
        {
            return Err(too_large(limit));
        }
        debug!(url, ?total, "downloading");
        copy_limited(&mut res, sink, limit, total, cancel, progress)
    }
}

/// In-memory `HttpFetch` for tests and offline embedders.
pub mod testing {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;

    use super::{HttpFetch, TransferProgress, copy_limited};
    use crate::cancel::CancelToken;
    use crate::error::{Error, ErrorKind, Result};

    /// In-memory routes keyed by exact URL; unknown URLs fail like a 404.
    #[derive(Default)]
    pub struct FakeHttp {
        pub json: BTreeMap<String, serde_json::Value>,
        pub files: BTreeMap<String, Vec<u8>>,
        pub downloads: Mutex<Vec<String>>,
    }

    impl FakeHttp {
        pub fn with_json(mut self, url: &str, v: serde_json::Value) -> Self {
            self.json.insert(url.to_string(), v);
            self
        }

        pub fn with_file(mut self, url: &str, body: Vec<u8>) -> Self {
            self.files.insert(url.to_string(), body);
            self
        }

        pub fn downloaded(&self) -> Vec<String> {
            self.downloads.lock().map(|d| d.clone()).unwrap_or_default()
        }
    }

    impl HttpFetch for FakeHttp {
        fn get_json(&self, url: &str, cancel: &CancelToken) -> Result<serde_json::Value> {
            cancel.check()?;
            self.json.get(url).cloned().ok_or_else(|| {
                Error::new(ErrorKind::Network, format!("GET {url} failed with status 404"))
            })
        }

        fn download(
            &self,
            url: &str,
            sink: &mut dyn Write,
            limit: u64,
            cancel: &CancelToken,
            progress: TransferProgress<'_>,
        ) -> Result<u64> {
            if let Ok(mut d) = self.downloads.lock() {
                d.push(url.to_string());
            }
            let body = self.files.get(url).ok_or_else(|| {
                Error::new(ErrorKind::Network, format!("GET {url} failed with status 404"))
            })?;
            copy_limited(
                &mut body.as_slice(),
                sink,
                limit,
                Some(body.len() as u64),
                cancel,
                progress,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_limited_counts_and_reports() {
        let data = vec![7u8; CHUNK * 2 + 5];
        let mut out: Vec<u8> = Vec::new();
        let mut seen = Vec::new();
        let n = copy_limited(
            &mut data.as_slice(),
            &mut out,
            u64::MAX,
            Some(data.len() as u64),
            &CancelToken::new(),
            &mut |got, _| seen.push(got),
        )
        .expect("copy");
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(seen.last().copied(), Some(data.len() as u64));
    }

    #[test]
    fn copy_limited_rejects_oversized_bodies() {
        let data = vec![1u8; 100];
        let mut out: Vec<u8> = Vec::new();
        let err = copy_limited(
            &mut data.as_slice(),
            &mut out,
            99,
            None,
            &CancelToken::new(),
            &mut |_, _| {},
        )
        .expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::TooLarge);
    }

    #[test]
    fn copy_limited_stops_when_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let err = copy_limited(
            &mut [0u8; 4].as_slice(),
            &mut Vec::<u8>::new(),
            10,
            None,
            &token,
            &mut |_, _| {},
        )
        .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
