//! Production [`Environment`] implementation for this crate: real system
//! time and OS cryptographic RNG, mirroring `booster-server::system_env`.

use std::time::Duration;

use booster_core::Environment;

/// Production environment used by [`crate::session::BoosterClient`] outside
/// of tests.
#[derive(Clone, Default)]
pub struct ClientSystemEnv;

impl ClientSystemEnv {
    /// Creates a new client-side system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for ClientSystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - client cannot generate ids");
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn client_system_env_time_advances() {
        let env = ClientSystemEnv::new();
        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();
        assert!(t2 > t1);
    }

    #[test]
    fn client_system_env_random_bytes_fills_buffer() {
        let env = ClientSystemEnv::new();
        let mut bytes = [0u8; 32];
        env.random_bytes(&mut bytes);
        assert!(bytes.iter().any(|&b| b != 0));
    }
}
