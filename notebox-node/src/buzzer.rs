//! Piezo buzzer driver using the ESP32 LEDC (PWM) peripheral.
//!
//! A passive piezo needs a square wave to produce sound, so the channel runs
//! at the configured duty and the timer frequency follows each note. At 13-bit
//! resolution the LEDC timer covers roughly 10 Hz to 9.7 kHz; notes outside
//! that range make `set_frequency` fail and the run is aborted.

use esp_idf_svc::hal::gpio::OutputPin;
use esp_idf_svc::hal::ledc::config::TimerConfig;
use esp_idf_svc::hal::ledc::{LedcDriver, LedcTimerDriver, LowSpeed, Resolution, CHANNEL0, TIMER0};
use esp_idf_svc::hal::peripheral::Peripheral;
use esp_idf_svc::hal::prelude::*;
use notebox::Tone;

pub struct LedcBuzzer {
    timer: LedcTimerDriver<'static, LowSpeed>,
    channel: LedcDriver<'static>,
    max_duty: u32,
}

impl LedcBuzzer {
    /// Takes ownership of the LEDC timer0, channel0, and the buzzer GPIO pin.
    /// The buzzer starts silent.
    pub fn new(
        timer: TIMER0,
        channel: CHANNEL0,
        pin: impl Peripheral<P = impl OutputPin> + 'static,
    ) -> anyhow::Result<Self> {
        // Start with an arbitrary frequency; each note sets its own.
        let timer = LedcTimerDriver::new(
            timer,
            &TimerConfig::default()
                .frequency(1000.Hz().into())
                .resolution(Resolution::Bits13),
        )?;

        let mut channel = LedcDriver::new(channel, &timer, pin)?;
        let max_duty = channel.get_max_duty();
        channel.set_duty(0)?;

        Ok(Self {
            timer,
            channel,
            max_duty,
        })
    }
}

impl Tone for LedcBuzzer {
    fn set_frequency(&mut self, hz: f32) -> anyhow::Result<()> {
        let hz = hz.round() as u32;
        self.timer.set_frequency(Hertz(hz))?;
        Ok(())
    }

    fn set_duty_percent(&mut self, percent: u8) -> anyhow::Result<()> {
        let duty = self.max_duty * u32::from(percent.min(100)) / 100;
        self.channel.set_duty(duty)?;
        Ok(())
    }
}
