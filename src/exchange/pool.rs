use std::sync::Mutex;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use crate::exchange::server::ServerExchange;
use crate::packet_header::MessageKind;

/// Source of server-side exchanges. A server rents an exchange when the first fragment of a new
///  request arrives, and returns it when the exchange completed or was abandoned.
///
/// Exhaustion is back pressure: a request for which no exchange can be rented is dropped, and
///  the client eventually times out.
#[cfg_attr(test, automock)]
pub trait ExchangePool: Send + Sync + 'static {
    fn try_rent(&self, kind: MessageKind) -> Option<ServerExchange>;

    fn release(&self, exchange: ServerExchange);
}

struct PoolInner {
    free: FxHashMap<MessageKind, Vec<ServerExchange>>,
    rented: FxHashMap<MessageKind, usize>,
}

/// An [ExchangePool] with a fixed capacity per message kind. Exchanges are created on demand
///  until a kind's capacity is reached, and are recycled afterwards.
pub struct FixedExchangePool {
    capacity_per_kind: usize,
    inner: Mutex<PoolInner>,
}

impl FixedExchangePool {
    pub fn new(capacity_per_kind: usize) -> FixedExchangePool {
        FixedExchangePool {
            capacity_per_kind,
            inner: Mutex::new(PoolInner {
                free: Default::default(),
                rented: Default::default(),
            }),
        }
    }

    pub fn num_rented(&self, kind: MessageKind) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.rented.get(&kind).copied().unwrap_or(0)
    }
}

impl ExchangePool for FixedExchangePool {
    fn try_rent(&self, kind: MessageKind) -> Option<ServerExchange> {
        if !kind.is_request() {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        let rented = inner.rented.get(&kind).copied().unwrap_or(0);
        if rented >= self.capacity_per_kind {
            debug!("exchange pool exhausted for {:?}: {} exchanges are rented", kind, rented);
            return None;
        }
        inner.rented.insert(kind, rented + 1);

        let exchange = inner.free.get_mut(&kind)
            .and_then(|free| free.pop())
            .unwrap_or_else(|| ServerExchange::new(kind));
        Some(exchange)
    }

    fn release(&self, mut exchange: ServerExchange) {
        let kind = exchange.kind();
        let reset_result = exchange.reset();

        let mut inner = self.inner.lock().unwrap();
        match inner.rented.get_mut(&kind) {
            Some(rented) if *rented > 0 => *rented -= 1,
            _ => {
                warn!("released {:?} that was not rented from this pool - discarding", exchange);
                return;
            }
        }

        if let Err(e) = reset_result {
            warn!("discarding exchange on release: {}", e);
            return;
        }
        inner.free.entry(kind).or_default().push(exchange);
    }
}
