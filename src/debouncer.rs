use std::collections::VecDeque;
use std::fmt;
use tokio::time::{Duration, Instant};

/// Object classes emitted by the smoking detection model, in model output order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Class {
    Person,
    Cigarette,
    Smoke,
    Fire,
}

impl Class {
    pub const ALL: [Class; 4] = [Class::Person, Class::Cigarette, Class::Smoke, Class::Fire];

    pub fn from_index(idx: usize) -> Option<Class> {
        Class::ALL.get(idx).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Class::Person => "Person",
            Class::Cigarette => "Cigarette",
            Class::Smoke => "Smoke",
            Class::Fire => "Fire",
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One inference cycle: which classes were seen and their best confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub at: Instant,
    confidences: [Option<f32>; 4],
}

impl Sample {
    pub fn new(at: Instant) -> Self {
        Sample {
            at,
            confidences: [None; 4],
        }
    }

    pub fn with(mut self, class: Class, confidence: f32) -> Self {
        self.observe(class, confidence);
        self
    }

    /// Marks `class` as seen, keeping the highest confidence reported for it.
    pub fn observe(&mut self, class: Class, confidence: f32) {
        let slot = &mut self.confidences[class.index()];
        *slot = Some(slot.map_or(confidence, |prev| prev.max(confidence)));
    }

    pub fn contains(&self, class: Class) -> bool {
        self.confidences[class.index()].is_some()
    }

    pub fn confidence(&self, class: Class) -> Option<f32> {
        self.confidences[class.index()]
    }

    pub fn classes(&self) -> impl Iterator<Item = Class> + '_ {
        Class::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    pub fn is_empty(&self) -> bool {
        self.confidences.iter().all(Option::is_none)
    }
}

/// How many observations inside the window make a class "sustained".
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Threshold {
    /// A fixed number of samples.
    Samples(usize),
    /// A duration of presence, converted to a count with the observed sample rate.
    Duration(Duration),
}

impl Threshold {
    /// Returns `None` when the count cannot be derived (no usable sample rate).
    pub fn required_count(&self, rate: f32) -> Option<usize> {
        match *self {
            Threshold::Samples(n) => Some(n.max(1)),
            Threshold::Duration(duration) => {
                if !rate.is_finite() || rate <= 0.0 {
                    return None;
                }
                let count = (duration.as_secs_f32() * rate).ceil();
                Some((count as usize).max(1))
            }
        }
    }
}

/// FIFO of recent observation times, bounded by a look-back duration.
#[derive(Debug, Clone)]
pub struct TimestampWindow {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl TimestampWindow {
    pub fn new(window: Duration) -> Self {
        TimestampWindow {
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Appends `now` when `seen` and evicts every entry older than the window.
    pub fn record(&mut self, now: Instant, seen: bool) {
        if seen {
            self.stamps.push_back(now);
        }

        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    #[cfg(test)]
    pub fn oldest(&self) -> Option<Instant> {
        self.stamps.front().copied()
    }

    pub fn is_sustained(&self, threshold: Threshold, rate: f32) -> bool {
        match threshold.required_count(rate) {
            Some(required) => self.stamps.len() >= required,
            None => false,
        }
    }
}

/// Last firing time of one alert channel.
#[derive(Debug, Clone)]
pub struct Cooldown {
    cycle: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(cycle: Duration) -> Self {
        Cooldown { cycle, last: None }
    }

    pub fn ready(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.cycle,
            None => true,
        }
    }

    pub fn fire(&mut self, now: Instant) {
        self.last = Some(now);
    }

    #[cfg(test)]
    pub fn last_fired(&self) -> Option<Instant> {
        self.last
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AlertKind {
    /// A person is lingering in the no-smoking area.
    Guide,
    /// A person is smoking.
    Warning,
}

/// A fired alert, handed to audio, upload and notification sinks.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub class: Class,
    pub confidence: f32,
}

/// Outcome of one debouncer tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verdict {
    pub warning: bool,
    pub guide: bool,
    pub audio: Option<Alert>,
    pub upload: Option<Alert>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebounceSettings {
    pub window: Duration,
    pub threshold: Threshold,
    pub guide_cycle: Duration,
    pub warning_cycle: Duration,
    pub upload_interval: Duration,
    /// Restart the guide cooldown whenever the warning channel fires.
    pub warning_resets_guide: bool,
}

/// Turns per-frame class flags into sustained states and rate-limited alerts.
#[derive(Debug)]
pub struct Debouncer {
    threshold: Threshold,
    windows: [TimestampWindow; 4],
    last_confidence: [f32; 4],
    guide: Cooldown,
    warning: Cooldown,
    upload: Cooldown,
    warning_resets_guide: bool,
}

impl Debouncer {
    pub fn new(settings: &DebounceSettings) -> Self {
        Debouncer {
            threshold: settings.threshold,
            windows: Class::ALL.map(|_| TimestampWindow::new(settings.window)),
            last_confidence: [0.0; 4],
            guide: Cooldown::new(settings.guide_cycle),
            warning: Cooldown::new(settings.warning_cycle),
            upload: Cooldown::new(settings.upload_interval),
            warning_resets_guide: settings.warning_resets_guide,
        }
    }

    pub fn window(&self, class: Class) -> &TimestampWindow {
        &self.windows[class.index()]
    }

    pub fn is_sustained(&self, class: Class, rate: f32) -> bool {
        self.window(class).is_sustained(self.threshold, rate)
    }

    /// Feeds one sample and decides which channels fire.
    ///
    /// `rate` is the observed sample rate in samples per second; it only
    /// matters for [`Threshold::Duration`]. Audio channels are considered only
    /// when `audio_idle` is set, so a busy speaker never consumes a cooldown.
    pub fn tick(&mut self, sample: &Sample, rate: f32, audio_idle: bool) -> Verdict {
        let now = sample.at;
        for class in Class::ALL {
            self.windows[class.index()].record(now, sample.contains(class));
            if let Some(confidence) = sample.confidence(class) {
                self.last_confidence[class.index()] = confidence;
            }
        }

        let person = self.is_sustained(Class::Person, rate);
        let cigarette = self.is_sustained(Class::Cigarette, rate);
        let smoke = self.is_sustained(Class::Smoke, rate);

        let warning = person && (cigarette || smoke);
        let guide = person && !warning;

        let mut verdict = Verdict {
            warning,
            guide,
            ..Verdict::default()
        };

        if audio_idle {
            if warning && self.warning.ready(now) {
                self.warning.fire(now);
                if self.warning_resets_guide {
                    self.guide.fire(now);
                }
                verdict.audio = Some(self.warning_alert(cigarette, smoke));
            } else if guide && self.guide.ready(now) {
                self.guide.fire(now);
                verdict.audio = Some(self.alert(AlertKind::Guide, Class::Person));
            }
        }

        if warning && self.upload.ready(now) {
            self.upload.fire(now);
            verdict.upload = Some(self.warning_alert(cigarette, smoke));
        }

        verdict
    }

    fn warning_alert(&self, cigarette: bool, smoke: bool) -> Alert {
        let class = match (cigarette, smoke) {
            (true, true) => {
                if self.last_confidence[Class::Smoke.index()]
                    > self.last_confidence[Class::Cigarette.index()]
                {
                    Class::Smoke
                } else {
                    Class::Cigarette
                }
            }
            (false, true) => Class::Smoke,
            _ => Class::Cigarette,
        };
        self.alert(AlertKind::Warning, class)
    }

    fn alert(&self, kind: AlertKind, class: Class) -> Alert {
        Alert {
            kind,
            class,
            confidence: self.last_confidence[class.index()],
        }
    }
}

/// Samples-per-second estimate, refreshed once at least a second has elapsed.
#[derive(Debug, Clone)]
pub struct RateMeter {
    started: Instant,
    frames: u32,
    rate: f32,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        RateMeter {
            started: now,
            frames: 0,
            rate: 0.0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= Duration::from_secs(1) {
            self.rate = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.started = now;
        }
        self.rate
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}
