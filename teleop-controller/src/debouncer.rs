use std::time::{Duration, Instant};

/// Turns a button level sampled every tick into at most one trigger per cooldown
#[derive(Debug, Clone)]
pub struct Debouncer {
    cooldown: Duration,
    last_fire: Option<Instant>,
}

impl Debouncer {
    pub fn new(cooldown: Duration) -> Debouncer {
        Debouncer {
            cooldown,
            last_fire: None,
        }
    }

    pub fn should_fire(&mut self, is_pressed: bool, now: Instant) -> bool {
        if !is_pressed {
            return false;
        }
        let cooled_down = match self.last_fire {
            None => true,
            Some(last_fire) => now.saturating_duration_since(last_fire) > self.cooldown,
        };
        if cooled_down {
            self.last_fire = Some(now);
        }
        cooled_down
    }

    pub fn last_fire(&self) -> Option<Instant> {
        self.last_fire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_press_fires() {
        let mut debouncer = Debouncer::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(debouncer.should_fire(true, now));
        assert_eq!(debouncer.last_fire(), Some(now));
    }

    #[test]
    fn released_button_never_fires() {
        let mut debouncer = Debouncer::new(Duration::from_secs(5));
        assert!(!debouncer.should_fire(false, Instant::now()));
        assert_eq!(debouncer.last_fire(), None);
    }

    #[test]
    fn held_press_fires_once_per_cooldown() {
        let cooldown = Duration::from_secs(5);
        let step = Duration::from_millis(10);
        let mut debouncer = Debouncer::new(cooldown);
        let start = Instant::now();
        let mut fired = vec![];
        let mut offset = Duration::ZERO;
        while offset <= cooldown * 2 {
            if debouncer.should_fire(true, start + offset) {
                fired.push(offset);
            }
            offset += step;
        }
        assert_eq!(fired, vec![Duration::ZERO, cooldown + step]);
    }

    #[test]
    fn cooldown_boundary_is_exclusive() {
        let cooldown = Duration::from_secs(5);
        let mut debouncer = Debouncer::new(cooldown);
        let start = Instant::now();
        assert!(debouncer.should_fire(true, start));
        assert!(!debouncer.should_fire(true, start + cooldown));
        assert!(debouncer.should_fire(true, start + cooldown + Duration::from_nanos(1)));
    }

    #[test]
    fn suppressed_presses_do_not_rearm() {
        let cooldown = Duration::from_secs(5);
        let mut debouncer = Debouncer::new(cooldown);
        let start = Instant::now();
        assert!(debouncer.should_fire(true, start));
        assert!(!debouncer.should_fire(true, start + Duration::from_secs(4)));
        assert!(debouncer.should_fire(true, start + Duration::from_secs(6)));
    }
}
