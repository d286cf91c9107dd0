use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::error::Result;

const STANDARD_REQUEST_TIMEOUT: u64 = 300;
// The lounge sends at least a noop roughly every half hour; time out just past it.
const LONG_POLL_TIMEOUT: u64 = 32 * 60;
const POOL_IDLE_TIMEOUT: u64 = 90;

/// The process-wide outbound client pair.
///
/// Consumers fetch a client per request instead of capturing one: when the
/// `use_proxy` flag flips, the pair is rebuilt under a new generation and the
/// old clients drain as their in-flight requests finish.
#[derive(Clone)]
pub struct SharedHttp {
    inner: Arc<Mutex<Generation>>,
    http_tracing: bool,
}

struct Generation {
    number: u64,
    use_proxy: bool,
    standard: Client,
    long_poll: Client,
}

impl SharedHttp {
    pub fn new(use_proxy: bool, http_tracing: bool) -> Result<Self> {
        let (standard, long_poll) = build_clients(use_proxy)?;
        Ok(SharedHttp {
            inner: Arc::new(Mutex::new(Generation {
                number: 0,
                use_proxy,
                standard,
                long_poll,
            })),
            http_tracing,
        })
    }

    /// Client for ordinary request/response calls.
    pub fn standard(&self) -> Client {
        self.inner.lock().unwrap().standard.clone()
    }

    /// Client with a timeout sized for the lounge long poll.
    pub fn long_poll(&self) -> Client {
        self.inner.lock().unwrap().long_poll.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().number
    }

    /// Applies a proxy-policy change. Returns true when the clients were
    /// rebuilt.
    pub fn set_proxy(&self, use_proxy: bool) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.use_proxy == use_proxy {
            return Ok(false);
        }
        let (standard, long_poll) = build_clients(use_proxy)?;
        inner.number += 1;
        inner.use_proxy = use_proxy;
        inner.standard = standard;
        inner.long_poll = long_poll;
        tracing::info!(use_proxy, generation = inner.number, "rebuilt outbound http clients");
        Ok(true)
    }

    pub fn tracing_enabled(&self) -> bool {
        self.http_tracing
    }

    /// Request/response trace hook, active only when `http_tracing` is set.
    pub fn trace(&self, method: &str, url: &str, status: Option<u16>) {
        if self.http_tracing {
            match status {
                Some(status) => tracing::debug!(target: "sbtv::http", method, url, status),
                None => tracing::debug!(target: "sbtv::http", method, url, "request"),
            }
        }
    }
}

fn build_clients(use_proxy: bool) -> Result<(Client, Client)> {
    let standard = builder(use_proxy)
        .timeout(Duration::from_secs(STANDARD_REQUEST_TIMEOUT))
        .build()?;
    let long_poll = builder(use_proxy)
        .timeout(Duration::from_secs(LONG_POLL_TIMEOUT))
        .build()?;
    Ok((standard, long_poll))
}

fn builder(use_proxy: bool) -> ClientBuilder {
    let builder = ClientBuilder::new().pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT)));
    if use_proxy {
        // honours the proxy environment, reqwest's default
        builder
    } else {
        builder.no_proxy()
    }
}
