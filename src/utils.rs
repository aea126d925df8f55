use std::{
    net::SocketAddr,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use socket2::SockAddr;

pub fn sock_addr_to_socket_addr(addr: SockAddr) -> Result<SocketAddr, std::io::Error> {
    match addr.as_socket() {
        Some(addr) => Ok(addr),
        None => Err(std::io::ErrorKind::AddrNotAvailable.into()),
    }
}

/// Tracks the remaining budget of a time-boxed operation.
#[derive(Debug, Clone, Copy)]
pub struct StopWatch {
    start: Instant,
    budget: Duration,
}

impl StopWatch {
    pub fn start(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn time_left(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn has_time_left(&self) -> bool {
        !self.time_left().is_zero()
    }
}

/// Locks the mutex, ignoring poisoning.
///
/// The state guarded by the crate's mutexes stays consistent between
/// statements, so a panic on another thread does not invalidate it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Waits on the condition variable for at most `timeout`, ignoring poisoning.
///
/// Callers re-check their condition afterwards, the wait may end early.
pub fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match condvar.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn stop_watch_runs_out() {
        let stop_watch = StopWatch::start(Duration::from_millis(20));
        assert!(stop_watch.has_time_left());
        assert!(stop_watch.time_left() <= Duration::from_millis(20));
        thread::sleep(Duration::from_millis(30));
        assert!(!stop_watch.has_time_left());
        assert_eq!(stop_watch.time_left(), Duration::ZERO);
        assert!(stop_watch.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn lock_survives_poisoning() {
        let mutex = Arc::new(Mutex::new(1));
        let cloned = mutex.clone();
        let _ = thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }

    #[test]
    fn wait_timeout_returns_after_timeout() {
        let mutex = Mutex::new(());
        let condvar = Condvar::new();
        let stop_watch = StopWatch::start(Duration::from_secs(1));
        let _guard = wait_timeout(&condvar, lock(&mutex), Duration::from_millis(10));
        assert!(stop_watch.has_time_left());
    }

    #[test]
    fn socket_addresses_convert() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(sock_addr_to_socket_addr(addr.into()).unwrap(), addr);
    }
}
