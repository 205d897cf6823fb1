//! Fair, bounded pool of channels to one endpoint
//!
//! Waiters are served strictly in arrival order. A checked-out channel goes
//! back to the pool when its guard drops, unless it was marked broken, in
//! which case it is closed and its slot freed.

use crate::transport::{Channel, Transport};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PoolState {
    idle: Vec<Box<dyn Channel>>,
    open: usize,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

struct PoolShared {
    transport: Arc<dyn Transport>,
    max_channels: usize,
    checkout_timeout: Duration,
    state: Mutex<PoolState>,
    changed: Condvar,
}

impl PoolShared {
    fn release(&self, channel: Box<dyn Channel>) {
        let mut state = self.state.lock();
        state.idle.push(channel);
        self.changed.notify_all();
    }

    fn discard(&self) {
        let mut state = self.state.lock();
        state.open -= 1;
        self.changed.notify_all();
    }
}

/// Channel pool over a [`Transport`]
pub struct ChannelPool {
    shared: Arc<PoolShared>,
}

impl ChannelPool {
    /// Pool of at most `max_channels` channels
    pub fn new(
        transport: Arc<dyn Transport>,
        max_channels: usize,
        checkout_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                transport,
                max_channels: max_channels.max(1),
                checkout_timeout,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Endpoint description
    pub fn describe(&self) -> String {
        self.shared.transport.describe()
    }

    /// Channels currently open (idle or checked out)
    pub fn open_channels(&self) -> usize {
        self.shared.state.lock().open
    }

    /// Idle channels
    pub fn idle_channels(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Check a channel out, waiting in line if none is free
    ///
    /// The guard owns its slot, so it may outlive the borrow of the pool.
    pub fn acquire(&self) -> Result<PooledChannel> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.checkout_timeout;
        let mut state = shared.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            let first_in_line = state.queue.front() == Some(&ticket);
            let available = !state.idle.is_empty() || state.open < shared.max_channels;
            if first_in_line && available {
                break;
            }
            if shared.changed.wait_until(&mut state, deadline).timed_out() {
                state.queue.retain(|t| *t != ticket);
                shared.changed.notify_all();
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "no channel to {} within {:?}",
                        shared.transport.describe(),
                        shared.checkout_timeout
                    ),
                )));
            }
        }
        state.queue.pop_front();

        if let Some(channel) = state.idle.pop() {
            shared.changed.notify_all();
            return Ok(PooledChannel::new(shared.clone(), channel));
        }

        // Reserve the slot, then connect without holding the lock.
        state.open += 1;
        shared.changed.notify_all();
        drop(state);
        match shared.transport.open() {
            Ok(channel) => Ok(PooledChannel::new(shared.clone(), channel)),
            Err(e) => {
                shared.discard();
                Err(e)
            }
        }
    }

    /// Close every idle channel
    pub fn close_idle(&self) {
        let mut state = self.shared.state.lock();
        let closed = state.idle.len();
        state.idle.clear();
        state.open -= closed;
        self.shared.changed.notify_all();
    }
}

/// A checked-out channel
pub struct PooledChannel {
    pool: Arc<PoolShared>,
    channel: Option<Box<dyn Channel>>,
    broken: bool,
}

impl PooledChannel {
    fn new(pool: Arc<PoolShared>, channel: Box<dyn Channel>) -> Self {
        Self {
            pool,
            channel: Some(channel),
            broken: false,
        }
    }

    /// Do not return this channel to the pool
    ///
    /// Required after any failure in the middle of a message, since the
    /// stream position is then unknown.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("channel is only taken on drop"),
        }
    }
}

impl DerefMut for PooledChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.channel {
            Some(channel) => channel.as_mut(),
            None => unreachable!("channel is only taken on drop"),
        }
    }
}

impl Read for PooledChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
}

impl Write for PooledChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            if self.broken || std::thread::panicking() {
                drop(channel);
                self.pool.discard();
            } else {
                self.pool.release(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        opened: AtomicUsize,
        fail: bool,
    }

    impl Transport for Counting {
        fn open(&self) -> Result<Box<dyn Channel>> {
            if self.fail {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(Vec::new())))
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn pool(max: usize, timeout: Duration) -> (Arc<Counting>, ChannelPool) {
        let transport = Arc::new(Counting {
            opened: AtomicUsize::new(0),
            fail: false,
        });
        let pool = ChannelPool::new(transport.clone(), max, timeout);
        (transport, pool)
    }

    #[test]
    fn test_channels_are_reused() {
        let (transport, pool) = pool(2, Duration::from_secs(1));
        {
            let mut channel = pool.acquire().unwrap();
            channel.write_all(b"x").unwrap();
        }
        {
            let _channel = pool.acquire().unwrap();
        }
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_channels(), 1);
    }

    #[test]
    fn test_broken_channel_is_discarded() {
        let (transport, pool) = pool(1, Duration::from_secs(1));
        {
            let mut channel = pool.acquire().unwrap();
            channel.mark_broken();
        }
        assert_eq!(pool.open_channels(), 0);
        let mut channel = pool.acquire().unwrap();
        let mut buf = Vec::new();
        channel.read_to_end(&mut buf).unwrap();
        assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let (_transport, pool) = pool(1, Duration::from_millis(50));
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let transport = Arc::new(Counting {
            opened: AtomicUsize::new(0),
            fail: true,
        });
        let pool = ChannelPool::new(transport, 1, Duration::from_millis(50));
        assert!(pool.acquire().is_err());
        assert_eq!(pool.open_channels(), 0);
    }

    #[test]
    fn test_waiters_served_in_arrival_order() {
        let (_transport, pool) = pool(1, Duration::from_secs(5));
        let pool = Arc::new(pool);
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = pool.acquire().unwrap();
        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                let _channel = pool.acquire().unwrap();
                order.lock().push(i);
                std::thread::sleep(Duration::from_millis(5));
            }));
            // Give each thread time to take its place in line.
            std::thread::sleep(Duration::from_millis(50));
        }
        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
