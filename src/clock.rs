//! Abstraction de l'horloge
//!
//! Le registre des blocages et la réconciliation lisent l'heure uniquement
//! via ce trait, ce qui permet de simuler l'écoulement du temps dans les tests.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Source de l'heure courante
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Horloge système réelle
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Horloge virtuelle pour les tests, avancée manuellement
#[derive(Debug)]
pub struct MockClock {
    current: Mutex<SystemTime>,
}

impl MockClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Horloge démarrant à `secs` secondes après l'epoch
    pub fn at_unix(secs: u64) -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn set(&self, time: SystemTime) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = time;
    }

    pub fn advance(&self, delta: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::at_unix(1_000);
        let start = clock.now();
        clock.advance(Duration::from_secs(3600));
        assert_eq!(clock.now().duration_since(start).unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_mock_clock_set() {
        let clock = MockClock::at_unix(0);
        let target = SystemTime::UNIX_EPOCH + Duration::from_secs(42);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        let now = SystemClock.now();
        assert!(now > SystemTime::UNIX_EPOCH + Duration::from_secs(1_577_836_800));
    }
}
