// ws90_exporter - Prometheus metrics exporter for WS90 weather stations
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::time::Duration;

/// Exponential delay between attempts to reconnect to the decoder.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);

        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt. Each call doubles the following
    /// delay, up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Start over from the initial delay after a healthy connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod test {
    use super::Backoff;
    use std::time::Duration;

    #[test]
    fn test_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(Duration::from_millis(100), backoff.next_delay());
        assert_eq!(Duration::from_millis(200), backoff.next_delay());
        assert_eq!(Duration::from_millis(400), backoff.next_delay());
        assert_eq!(Duration::from_millis(500), backoff.next_delay());
        assert_eq!(Duration::from_millis(500), backoff.next_delay());
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(Duration::from_secs(1), backoff.next_delay());
    }

    #[test]
    fn test_max_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(Duration::from_secs(5), backoff.next_delay());
        assert_eq!(Duration::from_secs(5), backoff.next_delay());
    }

    #[test]
    fn test_zero_initial() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(Duration::from_millis(1), backoff.next_delay());
    }
}
