//! Drains a note sequence to the buzzer.
//!
//! The driver owns every hardware seam it touches: a [`Tone`] generator for
//! the buzzer, optional [`Indicators`], an `embedded_hal` delay for the holds
//! and a [`DurationSource`] for randomized timing. A run is a blocking loop;
//! it returns only after the last note's gap has elapsed.

use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::NoteSequence;
use crate::config::{ServiceConfig, Timing};
use crate::frequency::PlaybackEvent;

// ── Hardware seams ─────────────────────────────────────────────────────────

/// A square-wave tone generator (the buzzer's PWM channel).
pub trait Tone {
    /// Sets the oscillation frequency, i.e. a period of `1 / hz` seconds.
    fn set_frequency(&mut self, hz: f32) -> anyhow::Result<()>;

    /// 0 silences the output; 50 is the loudest setting for a passive piezo.
    fn set_duty_percent(&mut self, percent: u8) -> anyhow::Result<()>;
}

/// One of three mutually exclusive signal lines lit while a note sounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorLine {
    Line0,
    Line1,
    Line2,
}

impl IndicatorLine {
    /// Multiples of three light line 0, other even notes line 1, the rest line 2.
    pub fn for_note(note: u8) -> Self {
        if note % 3 == 0 {
            IndicatorLine::Line0
        } else if note % 2 == 0 {
            IndicatorLine::Line1
        } else {
            IndicatorLine::Line2
        }
    }

    fn index(self) -> usize {
        match self {
            IndicatorLine::Line0 => 0,
            IndicatorLine::Line1 => 1,
            IndicatorLine::Line2 => 2,
        }
    }
}

pub trait Indicators {
    /// Lights `line` and turns the others off; `None` clears all three.
    fn show(&mut self, line: Option<IndicatorLine>) -> anyhow::Result<()>;
}

impl<I: Indicators + ?Sized> Indicators for Box<I> {
    fn show(&mut self, line: Option<IndicatorLine>) -> anyhow::Result<()> {
        (**self).show(line)
    }
}

/// For boards without indicator lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndicators;

impl Indicators for NoIndicators {
    fn show(&mut self, _line: Option<IndicatorLine>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Three GPIO outputs, active high.
pub struct PinIndicators<P> {
    pins: [P; 3],
}

impl<P: OutputPin> PinIndicators<P> {
    pub fn new(pins: [P; 3]) -> anyhow::Result<Self> {
        let mut indicators = Self { pins };
        indicators.show(None)?;
        Ok(indicators)
    }
}

impl<P: OutputPin> Indicators for PinIndicators<P> {
    fn show(&mut self, line: Option<IndicatorLine>) -> anyhow::Result<()> {
        let lit = line.map(IndicatorLine::index);
        for (i, pin) in self.pins.iter_mut().enumerate() {
            let res = if lit == Some(i) {
                pin.set_high()
            } else {
                pin.set_low()
            };
            res.map_err(|e| anyhow!("indicator line {i}: {e:?}"))?;
        }
        Ok(())
    }
}

/// Source of hold durations for [`Timing::Random`].
pub trait DurationSource {
    /// Next duration within `range`, both ends included.
    fn next_in(&mut self, range: &RangeInclusive<Duration>) -> Duration;
}

/// Uniform millisecond-granularity durations from any [`Rng`].
pub struct RngDurations<R> {
    rng: R,
}

impl<R: Rng> RngDurations<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RngDurations<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> DurationSource for RngDurations<R> {
    fn next_in(&mut self, range: &RangeInclusive<Duration>) -> Duration {
        let lo = range.start().as_millis() as u64;
        let hi = range.end().as_millis() as u64;
        if lo >= hi {
            return *range.start();
        }
        Duration::from_millis(self.rng.gen_range(lo..=hi))
    }
}

// ── Driver ─────────────────────────────────────────────────────────────────

/// Something that can play a whole sequence. Lets the trigger own a boxed driver.
pub trait Play: Send {
    /// Plays every note in order and returns how many were played.
    fn play(&mut self, sequence: &NoteSequence) -> anyhow::Result<usize>;
}

pub struct PlaybackDriver<T, I, D, S> {
    tone: T,
    indicators: I,
    delay: D,
    durations: S,
    timing: Timing,
    duty_percent: u8,
}

impl<T, I, D, S> PlaybackDriver<T, I, D, S>
where
    T: Tone,
    I: Indicators,
    D: DelayNs,
    S: DurationSource,
{
    pub fn new(tone: T, indicators: I, delay: D, durations: S, timing: Timing) -> Self {
        Self {
            tone,
            indicators,
            delay,
            durations,
            timing,
            duty_percent: 50,
        }
    }

    /// Timing and duty cycle taken from the service configuration.
    pub fn from_config(
        tone: T,
        indicators: I,
        delay: D,
        durations: S,
        config: &ServiceConfig,
    ) -> Self {
        Self::new(tone, indicators, delay, durations, config.timing.clone())
            .with_duty_percent(config.duty_percent)
    }

    pub fn with_duty_percent(mut self, percent: u8) -> Self {
        self.duty_percent = percent.min(100);
        self
    }

    /// Plays `sequence` note by note. An empty sequence touches no hardware.
    pub fn play(&mut self, sequence: &NoteSequence) -> anyhow::Result<usize> {
        if sequence.is_empty() {
            return Ok(0);
        }

        info!("Playing stored sequence (len={})", sequence.len());

        for (i, note) in sequence.iter().enumerate() {
            if let Err(e) = self.play_note(note) {
                self.silence();
                return Err(e.context(format!("note {i} ({note}) failed")));
            }
        }
        Ok(sequence.len())
    }

    fn play_note(&mut self, note: u8) -> anyhow::Result<()> {
        let (on, off) = self.hold_times();
        let event = PlaybackEvent::new(note, on, off);
        info!("  Note {} -> {:.2} Hz", event.note, event.frequency);

        self.tone.set_frequency(event.frequency)?;
        self.tone.set_duty_percent(self.duty_percent)?;
        self.indicators.show(Some(IndicatorLine::for_note(note)))?;
        self.hold(event.on);

        self.tone.set_duty_percent(0)?;
        self.hold(event.off);

        self.indicators.show(None)?;
        Ok(())
    }

    fn hold_times(&mut self) -> (Duration, Duration) {
        match &self.timing {
            Timing::Fixed { on, off } => (*on, *off),
            Timing::Random { on, off } => {
                let on = self.durations.next_in(on);
                let off = self.durations.next_in(off);
                (on, off)
            }
        }
    }

    fn hold(&mut self, d: Duration) {
        let ms = u32::try_from(d.as_millis()).unwrap_or(u32::MAX);
        self.delay.delay_ms(ms);
    }

    /// Best effort after a failed note: leave the buzzer quiet and the lines dark.
    fn silence(&mut self) {
        if let Err(e) = self.tone.set_duty_percent(0) {
            warn!("could not silence buzzer: {e:#}");
        }
        if let Err(e) = self.indicators.show(None) {
            debug!("could not clear indicators: {e:#}");
        }
    }
}

impl<T, I, D, S> Play for PlaybackDriver<T, I, D, S>
where
    T: Tone + Send,
    I: Indicators + Send,
    D: DelayNs + Send,
    S: DurationSource + Send,
{
    fn play(&mut self, sequence: &NoteSequence) -> anyhow::Result<usize> {
        PlaybackDriver::play(self, sequence)
    }
}


#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::convert::Infallible;

    use super::fakes::*;
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn empty_sequence_touches_nothing() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::fixed(), false);
        assert_eq!(drv.play(&NoteSequence::empty()).unwrap(), 0);
        assert!(rec.actions().is_empty());
    }

    #[test]
    fn plays_notes_in_order() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::fixed(), false);
        let played = drv.play(&NoteSequence::from_slice(&[60, 72, 48])).unwrap();

        assert_eq!(played, 3);
        assert_eq!(rec.cycles(), 3);
        let freqs = rec.frequencies();
        let expected = [261.63, 523.26, 130.815];
        assert_eq!(freqs.len(), 3);
        for (got, want) in freqs.iter().zip(expected) {
            assert!((got - want).abs() < 0.01, "got {got} Hz, want {want} Hz");
        }
    }

    #[test]
    fn one_note_actuation_sequence() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::fixed(), false);
        drv.play(&NoteSequence::from_slice(&[61])).unwrap();

        let actions = rec.actions();
        assert!(matches!(actions[0], Action::Frequency(_)));
        assert_eq!(
            &actions[1..],
            &[
                Action::Duty(50),
                Action::Indicator(Some(IndicatorLine::Line2)),
                Action::Hold(ms(200)),
                Action::Duty(0),
                Action::Hold(ms(50)),
                Action::Indicator(None),
            ]
        );
    }

    #[test]
    fn random_timing_draws_on_then_off() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::random(), false);
        drv.durations = ScriptedDurations(VecDeque::from([ms(120), ms(75), ms(390), ms(50)]));
        drv.play(&NoteSequence::from_slice(&[60, 62])).unwrap();

        assert_eq!(rec.holds(), vec![ms(120), ms(75), ms(390), ms(50)]);
    }

    #[test]
    fn custom_duty() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::fixed(), false).with_duty_percent(30);
        drv.play(&NoteSequence::from_slice(&[60])).unwrap();
        assert!(rec.actions().contains(&Action::Duty(30)));
    }

    #[test]
    fn from_config_takes_timing_and_duty() {
        let rec = Recorder::default();
        let config = ServiceConfig {
            duty_percent: 25,
            ..ServiceConfig::from(crate::config::Profile::Immediate)
        };
        let mut drv = PlaybackDriver::from_config(
            FakeTone {
                rec: rec.clone(),
                max_hz: 40_000.0,
            },
            Box::new(NoIndicators) as Box<dyn Indicators + Send>,
            FakeDelay {
                rec: rec.clone(),
                sleep: false,
            },
            ScriptedDurations(VecDeque::from([ms(300), ms(60)])),
            &config,
        );
        drv.play(&NoteSequence::from_slice(&[60])).unwrap();

        assert!(rec.actions().contains(&Action::Duty(25)));
        assert_eq!(rec.holds(), vec![ms(300), ms(60)]);
    }

    #[test]
    fn failing_note_silences_and_reports() {
        let rec = Recorder::default();
        let mut drv = driver(&rec, Timing::fixed(), false);
        // Note 200 is far above the fake's 40 kHz limit.
        let err = drv
            .play(&NoteSequence::from_slice(&[60, 200, 62]))
            .unwrap_err();

        assert!(format!("{err:#}").contains("note 1 (200)"), "{err:#}");
        assert_eq!(rec.cycles(), 1);
        let actions = rec.actions();
        assert_eq!(
            &actions[actions.len() - 2..],
            &[Action::Duty(0), Action::Indicator(None)]
        );
    }

    #[test]
    fn indicator_classification() {
        assert_eq!(IndicatorLine::for_note(60), IndicatorLine::Line0);
        assert_eq!(IndicatorLine::for_note(0), IndicatorLine::Line0);
        assert_eq!(IndicatorLine::for_note(62), IndicatorLine::Line1);
        assert_eq!(IndicatorLine::for_note(61), IndicatorLine::Line2);
        assert_eq!(IndicatorLine::for_note(65), IndicatorLine::Line2);
    }

    #[test]
    fn rng_durations_stay_in_range() {
        let mut src = RngDurations::new(StdRng::seed_from_u64(7));
        let range = ms(50)..=ms(400);
        for _ in 0..500 {
            let d = src.next_in(&range);
            assert!(range.contains(&d), "{d:?} outside {range:?}");
        }
    }

    #[test]
    fn rng_durations_degenerate_range() {
        let mut src = RngDurations::new(StdRng::seed_from_u64(1));
        assert_eq!(src.next_in(&(ms(80)..=ms(80))), ms(80));
    }

    struct Pin {
        high: bool,
    }

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.high = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.high = true;
            Ok(())
        }
    }

    #[test]
    fn pin_indicators_are_mutually_exclusive() {
        let pins = [Pin { high: true }, Pin { high: true }, Pin { high: false }];
        let mut ind = PinIndicators::new(pins).unwrap();
        assert!(ind.pins.iter().all(|p| !p.high));

        ind.show(Some(IndicatorLine::Line1)).unwrap();
        let lit: Vec<bool> = ind.pins.iter().map(|p| p.high).collect();
        assert_eq!(lit, vec![false, true, false]);

        ind.show(None).unwrap();
        assert!(ind.pins.iter().all(|p| !p.high));
    }
}
