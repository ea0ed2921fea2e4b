//! Server address discovery and selection.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::lock;

/// Decay window of the least-loaded latency estimate.
const DEFAULT_TAU: Duration = Duration::from_secs(10);

/// How [`Discovery::get`] picks among several addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
    /// Power of two choices over a peak-EWMA latency estimate.
    LeastLoaded,
}

impl FromStr for SelectMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(Self::Random),
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least-loaded" | "p2c" => Ok(Self::LeastLoaded),
            other => Err(RpcError::Discovery(format!("unknown select mode {other:?}"))),
        }
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Random => "random",
            Self::RoundRobin => "round-robin",
            Self::LeastLoaded => "least-loaded",
        })
    }
}

/// Source of server addresses (`proto@addr` strings).
///
/// `observe` is the only feedback a client sends back: the latency of a
/// completed call, used by least-loaded selection.
pub trait Discovery: Send + Sync {
    /// Re-fetch the address list from wherever it lives.
    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Replace the address list.
    fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address for `service`.
    fn get(&self, service: &str, mode: SelectMode) -> Result<String>;

    /// Every known address for `service`.
    fn get_all(&self, service: &str) -> Result<Vec<String>>;

    fn observe(&self, _addr: &str, _latency_nanos: u64) {}
}

/// A fixed, manually updated address list shared by every service name.
pub struct StaticDiscovery {
    state: Mutex<StaticState>,
}

struct StaticState {
    servers: Vec<String>,
    index: usize,
    latency: HashMap<String, PeakEwma>,
}

impl StaticDiscovery {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers: Vec<String> = servers.into_iter().map(Into::into).collect();
        // Start round-robin at a random offset so clients do not all hit the same server first.
        let index = if servers.is_empty() {
            0
        } else {
            rand::rng().random_range(0..servers.len())
        };
        Self {
            state: Mutex::new(StaticState {
                servers,
                index,
                latency: HashMap::new(),
            }),
        }
    }

    /// Current latency estimate for `addr` in nanoseconds, if observed.
    pub fn latency(&self, addr: &str) -> Option<u64> {
        lock(&self.state).latency.get(addr).map(|ewma| ewma.value)
    }
}

impl Discovery for StaticDiscovery {
    fn update(&self, servers: Vec<String>) -> Result<()> {
        let mut state = lock(&self.state);
        state.latency.retain(|addr, _| servers.contains(addr));
        state.servers = servers;
        Ok(())
    }

    fn get(&self, _service: &str, mode: SelectMode) -> Result<String> {
        let mut state = lock(&self.state);
        let n = state.servers.len();
        if n == 0 {
            return Err(no_servers());
        }

        let picked = match mode {
            SelectMode::Random => rand::rng().random_range(0..n),
            SelectMode::RoundRobin => {
                let picked = state.index % n;
                state.index = (picked + 1) % n;
                picked
            }
            SelectMode::LeastLoaded => state.pick_least_loaded(),
        };
        let addr = state.servers[picked].clone();
        debug!(%addr, %mode, "selected server");
        Ok(addr)
    }

    fn get_all(&self, _service: &str) -> Result<Vec<String>> {
        Ok(lock(&self.state).servers.clone())
    }

    fn observe(&self, addr: &str, latency_nanos: u64) {
        let mut state = lock(&self.state);
        if !state.servers.iter().any(|server| server == addr) {
            return;
        }
        state
            .latency
            .entry(addr.to_string())
            .or_insert_with(PeakEwma::new)
            .observe(latency_nanos, Instant::now());
    }
}

impl StaticState {
    fn pick_least_loaded(&self) -> usize {
        let n = self.servers.len();
        if n == 1 {
            return 0;
        }
        let mut rng = rand::rng();
        let a = rng.random_range(0..n);
        let mut b = rng.random_range(0..n - 1);
        if b >= a {
            b += 1;
        }
        if self.load(b) < self.load(a) { b } else { a }
    }

    fn load(&self, index: usize) -> u64 {
        self.latency
            .get(&self.servers[index])
            .map_or(0, |ewma| ewma.value)
    }
}

impl fmt::Debug for StaticDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("StaticDiscovery")
            .field("servers", &state.servers)
            .finish()
    }
}

pub(crate) fn no_servers() -> RpcError {
    RpcError::Discovery("no available servers".to_string())
}

/// Peak exponentially weighted moving average of call latency.
///
/// A sample above the current value replaces it outright; lower samples
/// decay it with weight `exp(-elapsed / tau)`.
#[derive(Debug, Clone)]
struct PeakEwma {
    stamp: Option<Instant>,
    value: u64,
    tau: Duration,
}

impl PeakEwma {
    fn new() -> Self {
        Self {
            stamp: None,
            value: 0,
            tau: DEFAULT_TAU,
        }
    }

    fn observe(&mut self, rtt: u64, now: Instant) {
        let elapsed = self
            .stamp
            .map_or(Duration::MAX, |stamp| now.saturating_duration_since(stamp));
        self.stamp = Some(now);

        if rtt > self.value {
            self.value = rtt;
        } else {
            let w = (-elapsed.as_secs_f64() / self.tau.as_secs_f64()).exp();
            self.value = (self.value as f64 * w + rtt as f64 * (1.0 - w)) as u64;
        }
    }
}
