//! Connection manager
//!
//! A `Session` is the process's one live channel to the broker. It is a cheap
//! cloneable handle; topology declaration, publishing and consuming all go
//! through the same underlying channel unless a caller opens another session.
//!
//! Connecting fails fast: there is no retry and no reconnect. A session must be
//! released with `close`, or used through `scoped`, which closes it on every
//! exit path.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::broker::BrokerChannel;
use crate::broker::amqp::AmqpChannel;
use crate::config::BrokerSettings;
use crate::utils::error::Result;

struct Inner {
    channel: Arc<dyn BrokerChannel>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("Session dropped without close; the broker will reclaim it");
        }
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connects to the AMQP broker described by `settings`.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        let channel = AmqpChannel::open(settings).await?;
        Ok(Self::from_channel(Arc::new(channel)))
    }

    pub fn from_channel(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn channel(&self) -> &dyn BrokerChannel {
        self.inner.channel.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Releases the session. Safe to call more than once; only the first call
    /// reaches the broker.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing session");
        self.inner.channel.close().await
    }

    /// Runs `f` with this session, then closes it whether `f` succeeded or
    /// not. An error from `f` wins over an error from closing.
    pub async fn scoped<F, Fut, T>(self, f: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = f(self.clone()).await;
        let closed = self.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}
