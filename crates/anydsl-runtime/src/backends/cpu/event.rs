//! Host events

use std::any::Any;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::backend::{Event, EventStatus};
use crate::error::{Result, RuntimeError};

/// Event completed by [`Event::record`]; host work is synchronous so
/// recording is completion.
#[derive(Default)]
pub struct CpuEvent {
    recorded_at: Mutex<Option<Instant>>,
    recorded: Condvar,
}

impl CpuEvent {
    pub fn new() -> Self {
        Self::default()
    }

    fn point_of_record(&self) -> Option<Instant> {
        *self.recorded_at.lock()
    }
}

impl Event for CpuEvent {
    fn record(&self) -> Result<()> {
        *self.recorded_at.lock() = Some(Instant::now());
        self.recorded.notify_all();
        Ok(())
    }

    fn query(&self, other: Option<&dyn Event>, elapsed: bool) -> Result<EventStatus> {
        let other = match other {
            Some(other) => Some(
                other
                    .as_any()
                    .downcast_ref::<CpuEvent>()
                    .ok_or_else(|| RuntimeError::device_mismatch("host event", "non-host event"))?,
            ),
            None => None,
        };

        let Some(start) = self.point_of_record() else {
            return Ok(EventStatus::NotReady);
        };
        let end = match other {
            Some(other) => match other.point_of_record() {
                Some(end) => Some(end),
                None => return Ok(EventStatus::NotReady),
            },
            None => None,
        };

        let elapsed_ms = if elapsed {
            let end = end.ok_or_else(|| RuntimeError::invalid_pointer("elapsed time needs an end event"))?;
            // Signed microseconds, so an end recorded before the start is negative.
            let micros = if end >= start {
                end.duration_since(start).as_micros() as f64
            } else {
                -(start.duration_since(end).as_micros() as f64)
            };
            Some((micros / 1000.0) as f32)
        } else {
            None
        };

        Ok(EventStatus::Complete { elapsed_ms })
    }

    fn sync(&self) -> Result<()> {
        let mut recorded_at = self.recorded_at.lock();
        while recorded_at.is_none() {
            self.recorded.wait(&mut recorded_at);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_not_ready_until_recorded() {
        let start = CpuEvent::new();
        let end = CpuEvent::new();

        assert_eq!(start.query(None, false).unwrap(), EventStatus::NotReady);
        start.record().unwrap();
        assert!(start.query(None, false).unwrap().is_complete());
        assert_eq!(start.query(Some(&end as &dyn Event), true).unwrap(), EventStatus::NotReady);
    }

    #[test]
    fn test_elapsed_time() {
        let start = CpuEvent::new();
        let end = CpuEvent::new();
        start.record().unwrap();
        thread::sleep(Duration::from_millis(5));
        end.record().unwrap();

        let EventStatus::Complete { elapsed_ms: Some(ms) } = start.query(Some(&end as &dyn Event), true).unwrap() else {
            panic!("expected elapsed time");
        };
        assert!(ms >= 5.0, "elapsed {ms}ms");

        let EventStatus::Complete { elapsed_ms: Some(back) } = end.query(Some(&start as &dyn Event), true).unwrap() else {
            panic!("expected elapsed time");
        };
        assert!(back <= -5.0);
    }

    #[test]
    fn test_query_self() {
        let event = CpuEvent::new();
        event.record().unwrap();
        assert_eq!(
            event.query(Some(&event as &dyn Event), true).unwrap(),
            EventStatus::Complete { elapsed_ms: Some(0.0) }
        );
    }

    #[test]
    fn test_sync_wakes_on_record() {
        let event = Arc::new(CpuEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.sync())
        };

        thread::sleep(Duration::from_millis(10));
        event.record().unwrap();
        waiter.join().unwrap().unwrap();
    }
}
