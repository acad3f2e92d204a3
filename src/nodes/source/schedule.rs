//! Start/stop bookkeeping shared by the generator sources

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Scheduled,
    Playing,
    Finished,
}

/// What a source does at one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tick {
    Silent,
    Audible,
    /// The stop frame was reached at this frame; the source stays silent from here on.
    Ended,
}

/// Start and stop frames of a generator, with the frames scheduled on the render node
/// surviving descriptions that omit them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SourceSchedule {
    start: Option<u64>,
    stop: Option<u64>,
    state: State,
}

impl SourceSchedule {
    pub(crate) fn new(start: Option<u64>, stop: Option<u64>) -> Self {
        Self {
            start,
            stop,
            state: State::Scheduled,
        }
    }

    pub(crate) fn update(&mut self, start: Option<u64>, stop: Option<u64>) {
        if self.state == State::Scheduled {
            self.start = start.or(self.start);
        }
        self.stop = stop.or(self.stop);
    }

    pub(crate) fn schedule_start(&mut self, frame: u64) {
        if self.state == State::Scheduled {
            self.start = Some(frame);
        }
    }

    pub(crate) fn schedule_stop(&mut self, frame: u64) {
        self.stop = Some(frame);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    #[inline]
    pub(crate) fn tick(&mut self, now: u64) -> Tick {
        match self.state {
            State::Finished => Tick::Silent,
            _ if self.start.is_some() && matches!(self.stop, Some(stop) if now >= stop) => {
                self.state = State::Finished;
                Tick::Ended
            }
            State::Playing => Tick::Audible,
            State::Scheduled => match self.start {
                Some(start) if now >= start => {
                    self.state = State::Playing;
                    Tick::Audible
                }
                _ => Tick::Silent,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_between_start_and_stop() {
        let mut schedule = SourceSchedule::new(Some(2), Some(4));
        let ticks: Vec<Tick> = (0..6).map(|now| schedule.tick(now)).collect();
        assert_eq!(
            ticks,
            [Tick::Silent, Tick::Silent, Tick::Audible, Tick::Audible, Tick::Ended, Tick::Silent]
        );
        assert!(schedule.is_finished());
    }

    #[test]
    fn stop_waits_for_a_start() {
        let mut schedule = SourceSchedule::new(None, Some(10));
        assert_eq!(schedule.tick(1_000_000), Tick::Silent);
        schedule.schedule_start(1_000_001);
        assert_eq!(schedule.tick(1_000_001), Tick::Ended);
    }

    #[test]
    fn start_is_fixed_once_playing() {
        let mut schedule = SourceSchedule::new(Some(0), None);
        assert_eq!(schedule.tick(0), Tick::Audible);
        schedule.update(Some(100), None);
        schedule.schedule_start(200);
        assert_eq!(schedule.tick(1), Tick::Audible);
        schedule.update(None, Some(5));
        assert_eq!(schedule.tick(5), Tick::Ended);
    }

    #[test]
    fn stop_before_start_never_plays() {
        let mut schedule = SourceSchedule::new(Some(10), Some(5));
        assert_eq!(schedule.tick(5), Tick::Ended);
        assert_eq!(schedule.tick(10), Tick::Silent);
    }
}
