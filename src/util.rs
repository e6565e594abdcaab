/// Human-readable elapsed-time display for the per-compilation log lines.
pub struct DurationDisplay(pub std::time::Duration);

impl std::fmt::Display for DurationDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos >= 1_000_000_000 {
            write!(f, "{:.3} seconds", self.0.as_secs_f64())
        } else if nanos >= 1_000_000 {
            write!(f, "{:.3} ms", nanos as f64 / 1_000_000.0)
        } else if nanos >= 1_000 {
            write!(f, "{:.3} us", nanos as f64 / 1_000.0)
        } else {
            write!(f, "{} ns", nanos)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn picks_a_sensible_unit() {
        assert_eq!(
            DurationDisplay(Duration::from_millis(1500)).to_string(),
            "1.500 seconds"
        );
        assert_eq!(
            DurationDisplay(Duration::from_micros(2500)).to_string(),
            "2.500 ms"
        );
        assert_eq!(DurationDisplay(Duration::from_nanos(999)).to_string(), "999 ns");
    }
}
