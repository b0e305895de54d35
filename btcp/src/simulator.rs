//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability machinery without depending on actual network conditions,
//! [`pair`] builds two connected [`SimLink`] transports whose outbound path
//! applies a configurable fault model:
//!
//! | Fault       | Description                                              |
//! |-------------|----------------------------------------------------------|
//! | Loss        | Drop a segment with probability `loss_rate`.             |
//! | Duplication | Deliver a segment twice.                                 |
//! | Corruption  | Flip one random bit so the checksum no longer matches.   |
//! | Reordering  | Hold a segment back for `reorder_delay`, letting later   |
//! |             | segments overtake it.                                    |
//! | Drop rule   | Drop exactly the segments a test-supplied predicate      |
//! |             | picks out.                                               |
//!
//! Every link draws from its own seeded RNG, so a failing run can be
//! replayed with the same seed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use crate::segment::{Flags, Segment};
use crate::transport::{Frame, Inbound, Transport};

/// Fault-injection settings for one direction of a link.
///
/// All rates are probabilities in `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultModel {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub corrupt_rate: f64,
    pub reorder_rate: f64,
    /// Hold-back applied to reordered segments.
    pub reorder_delay: Duration,
    pub seed: u64,
}

impl Default for FaultModel {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(20),
            seed: 0,
        }
    }
}

impl FaultModel {
    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    pub fn with_duplicates(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }

    pub fn with_corruption(mut self, rate: f64) -> Self {
        self.corrupt_rate = rate;
        self
    }

    pub fn with_reordering(mut self, rate: f64, delay: Duration) -> Self {
        self.reorder_rate = rate;
        self.reorder_delay = delay;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Predicate selecting outbound segments to drop.
pub type DropRule = Box<dyn FnMut(&Segment) -> bool + Send>;

/// Per-link counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    /// Segments handed to the link.
    pub sent: usize,
    /// Copies put on the peer's inbound channel (delayed ones included).
    pub delivered: usize,
    pub dropped: usize,
    pub duplicated: usize,
    pub corrupted: usize,
    pub reordered: usize,
}

/// What the dice decided for one segment.
struct Fate {
    drop: bool,
    corrupt_bit: Option<usize>,
    duplicate: bool,
    reorder: bool,
}

/// One endpoint's outbound half of a simulated link.
pub struct SimLink {
    name: &'static str,
    local: SocketAddr,
    faults: FaultModel,
    peer_tx: mpsc::UnboundedSender<Frame>,
    rng: Mutex<StdRng>,
    drop_rule: Mutex<Option<DropRule>>,
    /// `(flags, seq_n)` of every segment handed to the link.
    history: Mutex<Vec<(Flags, u16)>>,
    stats: Mutex<LinkStats>,
    detached: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Two linked transports, `a` and `b`.
///
/// `a_faults` applies to everything `a` sends, `b_faults` to everything `b`
/// sends.  Each half comes with the channel its socket reads from.
pub fn pair(
    a_faults: FaultModel,
    b_faults: FaultModel,
) -> ((Arc<SimLink>, Inbound), (Arc<SimLink>, Inbound)) {
    let a_addr = SocketAddr::from(([127, 0, 0, 1], 1));
    let b_addr = SocketAddr::from(([127, 0, 0, 1], 2));
    let (to_a, a_inbound) = mpsc::unbounded_channel();
    let (to_b, b_inbound) = mpsc::unbounded_channel();

    let a = SimLink::new("a", a_addr, a_faults, to_b);
    let b = SimLink::new("b", b_addr, b_faults, to_a);
    ((a, a_inbound), (b, b_inbound))
}

impl SimLink {
    fn new(
        name: &'static str,
        local: SocketAddr,
        faults: FaultModel,
        peer_tx: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            local,
            rng: Mutex::new(StdRng::seed_from_u64(faults.seed)),
            faults,
            peer_tx,
            drop_rule: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            stats: Mutex::new(LinkStats::default()),
            detached: AtomicBool::new(false),
        })
    }

    /// Install a predicate; segments it returns `true` for are dropped.
    pub fn set_drop_rule(&self, rule: DropRule) {
        *lock(&self.drop_rule) = Some(rule);
    }

    pub fn stats(&self) -> LinkStats {
        *lock(&self.stats)
    }

    /// How many segments with exactly `flags` were sent.
    pub fn sends_with(&self, flags: Flags) -> usize {
        lock(&self.history).iter().filter(|(f, _)| *f == flags).count()
    }

    /// How many data segments with sequence number `seq_n` were sent.
    pub fn data_sends_of(&self, seq_n: u16) -> usize {
        lock(&self.history)
            .iter()
            .filter(|(f, s)| f.is_empty() && *s == seq_n)
            .count()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Relaxed)
    }

    fn roll(&self, len: usize) -> Fate {
        let f = &self.faults;
        let mut rng = lock(&self.rng);
        let drop = rng.random_bool(f.loss_rate.clamp(0.0, 1.0));
        let corrupt = rng.random_bool(f.corrupt_rate.clamp(0.0, 1.0));
        let corrupt_bit = corrupt.then(|| rng.random_range(0..len * 8));
        let duplicate = rng.random_bool(f.duplicate_rate.clamp(0.0, 1.0));
        let reorder = rng.random_bool(f.reorder_rate.clamp(0.0, 1.0));
        Fate {
            drop,
            corrupt_bit,
            duplicate,
            reorder,
        }
    }

    fn deliver(&self, bytes: Vec<u8>, delay: Option<Duration>) {
        lock(&self.stats).delivered += 1;
        let frame = (bytes, self.local);
        match (delay, tokio::runtime::Handle::try_current()) {
            (Some(delay), Ok(handle)) => {
                let tx = self.peer_tx.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(frame);
                });
            }
            _ => {
                // Receiver gone means the peer socket closed.
                let _ = self.peer_tx.send(frame);
            }
        }
    }
}

impl Transport for SimLink {
    fn send_segment(&self, frame: &[u8]) {
        if self.is_detached() {
            return;
        }
        lock(&self.stats).sent += 1;

        if let Ok(segment) = Segment::decode(frame) {
            lock(&self.history).push((segment.flags, segment.seq_n));
            let ruled_out = lock(&self.drop_rule)
                .as_mut()
                .is_some_and(|rule| rule(&segment));
            if ruled_out {
                log::trace!("[sim {}] rule dropped {} seq={}", self.name, segment.flags, segment.seq_n);
                lock(&self.stats).dropped += 1;
                return;
            }
        }

        let fate = self.roll(frame.len().max(1));
        if fate.drop {
            lock(&self.stats).dropped += 1;
            return;
        }

        let mut bytes = frame.to_vec();
        if let Some(bit) = fate.corrupt_bit.filter(|_| !bytes.is_empty()) {
            bytes[bit / 8] ^= 1 << (bit % 8);
            lock(&self.stats).corrupted += 1;
        }

        let delay = if fate.reorder {
            lock(&self.stats).reordered += 1;
            Some(self.faults.reorder_delay)
        } else {
            None
        };

        if fate.duplicate {
            lock(&self.stats).duplicated += 1;
            self.deliver(bytes.clone(), None);
        }
        self.deliver(bytes, delay);
    }

    fn detach(&self) {
        if !self.detached.swap(true, Ordering::Relaxed) {
            log::debug!("[sim {}] detached", self.name);
        }
    }
}
