#![no_main]
#![no_std]

use defmt_rtt as _;
use panic_probe as _;

use hal::{self, clocks::Clocks, pac};
use rtic_monotonics::systick::prelude::*;

// Import custom modules from tachopot_algo crate
use tachopot_algo::{Config, ControlLoop, PulseCapture, PulseSource};

use cortex_m;

systick_monotonic!(Mono, 1_000);

/// The G431 ADC converts at 12 bits.
const CONFIG: Config = Config::new().with_analog_max(4095);

/// Monotonic milliseconds, wrapping at 2^32.
fn now_ms() -> u32 {
    Mono::now().ticks() as u32
}

/// Idle-side view of the capture cell. Every call is a single resource lock,
/// masking the hall interrupt only for the read (and clear) itself.
struct LockedCapture<M>(M);

impl<M> PulseSource for LockedCapture<M>
where
    M: rtic::Mutex<T = PulseCapture>,
{
    fn try_take_period(&mut self) -> Option<u32> {
        self.0.lock(|capture| capture.try_take_period())
    }

    fn last_pulse_ms(&mut self) -> Option<u32> {
        self.0.lock(|capture| capture.last_pulse_ms())
    }
}

#[rtic::app(device = pac, peripherals = true)]
mod app {
    use super::*;

    use core::cell::RefCell;

    use tachopot_drivers::{
        digipot::DigiPot,
        hall::HallSensor,
        i2c_bus::{self, I2cBus},
        lcd::Lcd1602,
        panel::OperatorPanel,
        pinout,
        timebase::{CycleDelay, TimClock},
    };

    #[shared]
    struct Shared {
        capture: PulseCapture,
    }

    #[local]
    struct Local {
        hall: HallSensor,
        timebase: TimClock,
        control: ControlLoop,
        panel: OperatorPanel,
        bus: I2cBus,
        delay: CycleDelay,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let dp = cx.device;
        let clock_cfg = Clocks::default();
        clock_cfg.setup().unwrap();

        let sysclk_freq = clock_cfg.sysclk(); // System clock frequency in Hz
        defmt::debug!("SYSTEM: Clock frequency is {} MHz", sysclk_freq / 1000000);

        Mono::start(cx.core.SYST, sysclk_freq);
        let delay = CycleDelay::new(sysclk_freq);

        let mut panel = OperatorPanel::new(dp.ADC1, &clock_cfg);
        panel.startup_pulse(&delay);

        let bus: I2cBus = RefCell::new(i2c_bus::new_i2c1(dp.I2C1, &clock_cfg));

        // Display is informational only, a missing one does not stop the motor
        if let Err(fault) = Lcd1602::new(&bus, delay).init() {
            defmt::warn!("LCD: not responding ({})", fault);
        }

        let mut control = ControlLoop::new(CONFIG);
        match control.bring_up(&mut DigiPot::new(&bus)) {
            Ok(()) => {
                defmt::info!("DIGIPOT: present at {=u8:#x}", pinout::bus::DIGIPOT_ADDR);
                panel.indicate_bus_ok();
            }
            Err(err) => {
                // Wiring or assembly defect: latch the fault LED and stop here for good
                defmt::error!("DIGIPOT: {} at {=u8:#x}, halting", err, pinout::bus::DIGIPOT_ADDR);
                panel.indicate_fault();
                halt();
            }
        }

        let timebase = TimClock::new(dp.TIM2, &clock_cfg);
        let hall = HallSensor::new();

        defmt::info!("CONTROL: running, {}", CONFIG);

        (
            Shared {
                capture: PulseCapture::new(),
            },
            Local {
                hall,
                timebase,
                control,
                panel,
                bus,
                delay,
            },
        )
    }

    #[idle(shared = [capture], local = [control, panel, bus, delay])]
    fn idle(cx: idle::Context) -> ! {
        let bus: &I2cBus = cx.local.bus;
        let mut pot = DigiPot::new(bus);
        let mut lcd = Lcd1602::new(bus, *cx.local.delay);
        let mut pulses = LockedCapture(cx.shared.capture);

        cx.local
            .control
            .run(now_ms, cx.local.panel, &mut pulses, &mut pot, &mut lcd)
    }

    // Hall sensor falling edge: timestamp and publish the period
    #[task(binds = EXTI0, priority = 2, shared = [capture], local = [hall, timebase])]
    fn hall_falling_edge(mut cx: hall_falling_edge::Context) {
        cx.local.hall.clear_pending();

        let now_us = cx.local.timebase.now_us();
        let now_ms = now_ms();
        cx.shared.capture.lock(|capture| {
            capture.on_falling_edge(now_us, now_ms);
        });
    }
}

/// Permanent stop with interrupts still masked from `init`.
fn halt() -> ! {
    loop {
        cortex_m::asm::nop();
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
