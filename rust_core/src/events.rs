/// A single marked event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: f64,
    pub mark: f64,
}

/// Marked events on `[0, horizon]`, kept sorted by time.
///
/// Two events closer in time than `tolerance` are considered to collide,
/// so a proposal can never create an ambiguous pair.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEvents {
    horizon: f64,
    tolerance: f64,
    events: Vec<Event>,
}

impl OrderedEvents {
    pub fn new(horizon: f64, tolerance: f64) -> Self {
        Self {
            horizon,
            tolerance,
            events: Vec::new(),
        }
    }

    pub fn horizon(&self) -> f64 {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    fn position(&self, time: f64) -> Result<usize, usize> {
        let idx = self.events.partition_point(|e| e.time < time - self.tolerance);
        match self.events.get(idx) {
            Some(e) if (e.time - time).abs() <= self.tolerance => Ok(idx),
            _ => Err(idx),
        }
    }

    /// Insert an event. Returns false when the time lies outside the horizon
    /// or collides with an existing event.
    pub fn add_event(&mut self, time: f64, mark: f64) -> bool {
        if !(0.0..=self.horizon).contains(&time) {
            return false;
        }
        match self.position(time) {
            Ok(_) => false,
            Err(idx) => {
                self.events.insert(idx, Event { time, mark });
                true
            }
        }
    }

    /// Index of the event at `time`, within tolerance.
    pub fn index_of(&self, time: f64) -> Option<usize> {
        self.position(time).ok()
    }

    pub fn remove_event(&mut self, index: usize) -> Event {
        self.events.remove(index)
    }

    /// Replace the mark of the event at `time`. Returns false when no such event exists.
    pub fn change_event(&mut self, time: f64, mark: f64) -> bool {
        match self.position(time) {
            Ok(idx) => {
                self.events[idx].mark = mark;
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_stay_sorted() {
        let mut events = OrderedEvents::new(10.0, 1e-9);
        assert!(events.add_event(5.0, 1.0));
        assert!(events.add_event(2.0, 2.0));
        assert!(events.add_event(7.5, 3.0));
        let times: Vec<f64> = events.events().iter().map(|e| e.time).collect();
        assert_eq!(times, vec![2.0, 5.0, 7.5]);
    }

    #[test]
    fn test_collisions_and_horizon_are_rejected() {
        let mut events = OrderedEvents::new(1.0, 1e-6);
        assert!(events.add_event(0.5, 1.0));
        assert!(!events.add_event(0.5 + 1e-8, 2.0));
        assert!(!events.add_event(1.5, 2.0));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_change_event_requires_existing_time() {
        let mut events = OrderedEvents::new(1.0, 1e-9);
        events.add_event(0.25, 1.0);
        assert!(events.change_event(0.25, 4.0));
        assert_eq!(events.get(0).unwrap().mark, 4.0);
        assert!(!events.change_event(0.75, 4.0));
    }
}
