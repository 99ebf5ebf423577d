use relay_core::{ChatMessage, ChatRequest, ChatSuccess, RelayError, RelayResponse, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::transport::{ProxyReply, ProxyTransport};

/// A successful relay together with how long the round trip took.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayReply {
    pub payload: ChatSuccess,
    pub elapsed: Duration,
}

/// Sends chat turns to the proxy, one at a time.
pub struct RelayClient {
    transport: Arc<dyn ProxyTransport>,
    model: Option<String>,
    in_flight: AtomicBool,
    last_latency: Mutex<Option<Duration>>,
}

/// Holds the in-flight flag for the lifetime of one send.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RelayError::AlreadyInFlight)?;
        Ok(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl RelayClient {
    pub fn new(transport: Arc<dyn ProxyTransport>, model: Option<String>) -> Self {
        Self {
            transport,
            model,
            in_flight: AtomicBool::new(false),
            last_latency: Mutex::new(None),
        }
    }

    /// Relays one message with the given history.
    ///
    /// A call made while another is still pending fails with
    /// [`RelayError::AlreadyInFlight`] without touching the network.
    pub async fn send(&self, message: &str, history: &[ChatMessage]) -> Result<RelayReply> {
        let _guard = InFlightGuard::acquire(&self.in_flight).inspect_err(|_| {
            warn!("Rejected send: a request is already in flight");
        })?;

        let mut request = ChatRequest::new(message).with_conversation(history.to_vec());
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let started = Instant::now();
        let outcome = self.transport.post_chat(&request).await;
        let elapsed = started.elapsed();
        *self.last_latency.lock().unwrap_or_else(PoisonError::into_inner) = Some(elapsed);
        debug!("Relay round trip took {}ms", elapsed.as_millis());

        match outcome? {
            ProxyReply {
                response: RelayResponse::Success(payload),
                ..
            } => Ok(RelayReply { payload, elapsed }),
            ProxyReply {
                status,
                response: RelayResponse::Failure(failure),
            } => Err(failure.into_error(status)),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Round-trip time of the most recent send that reached the transport.
    pub fn last_latency(&self) -> Option<Duration> {
        *self.last_latency.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
