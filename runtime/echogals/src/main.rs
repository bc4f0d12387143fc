// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    clap::{Parser, ValueEnum},
    echo_gals_protocols::{card::*, emulator::*, mtc::*, non_paged::*, *},
    glib::Error,
    nix::sys::signal,
    runtime_core::{cmdline::*, dispatcher::*, LogLevel, *},
    std::{path::PathBuf, sync::mpsc},
    tracing::{debug, debug_span, warn, Level},
};

enum Event {
    Shutdown,
    Timer,
}

/// The parameters given by command line.
#[derive(Debug, Clone)]
struct ServiceConfig {
    card_type: CardType,
    device: Option<DspDevice>,
    rate: Option<u32>,
    clock: Option<InputClock>,
    digital_mode: Option<DigitalMode>,
    professional_spdif: bool,
    firmware_dir: Option<PathBuf>,
    mtc_params: MtcSyncParams,
}

type ServiceCard = NonPagedBox<'static, EchoGalsMtc<'static, EmulatedCard>, EmulatedCard>;

struct EchoGalsRuntime {
    card: ServiceCard,
    mixer: MixerCookie,
    config: ServiceConfig,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
    timer: Option<Dispatcher>,
    detected_clocks: InputClockMask,
}

impl Drop for EchoGalsRuntime {
    fn drop(&mut self) {
        // At first, stop event loop in all of dispatchers to avoid queueing new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }
        self.timer = None;

        // Next, consume all events in queue to release blocked thread for sender.
        for _ in self.rx.try_iter() {}

        // Finally Finish I/O threads.
        self.dispatchers.clear();

        if let Err(e) = self.card.set_meters_on(false) {
            warn!("Fail to turn meters off: {}", e);
        }

        if let Err(e) = self.card.close_mixer(self.mixer) {
            warn!("Fail to close mixer: {}", e);
        }
    }
}

fn default_dsp_device(card_type: CardType) -> DspDevice {
    match card_type {
        CardType::Layla20 => DspDevice::Dsp56301,
        _ => DspDevice::Dsp56361,
    }
}

impl RuntimeOperation<ServiceConfig> for EchoGalsRuntime {
    fn new(config: ServiceConfig, log_level: Option<LogLevel>) -> Result<Self, Error> {
        if let Some(level) = log_level {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(level))
                .init();
        }

        let device = config
            .device
            .unwrap_or_else(|| default_dsp_device(config.card_type));
        let os = match &config.firmware_dir {
            Some(path) => EmulatedCard::with_firmware_directory(config.card_type, device, path)?,
            None => EmulatedCard::new(config.card_type, device),
        };
        // The card refers to the emulator till the end of program.
        let os: &'static EmulatedCard = Box::leak(Box::new(os));

        let card = EchoGalsMtc::new(config.card_type, os, config.mtc_params)?;
        let mut card = NonPagedBox::new(os, card)?;

        let enter = debug_span!("init").entered();
        let mixer = card.open_mixer(None)?;
        card.init_hw()?;
        let caps = card.capabilities()?;
        debug!(
            name = caps.name,
            ?device,
            mixer = mixer.0,
            outputs = caps.bus_output_count(),
            inputs = caps.bus_input_count(),
            midi = caps.midi_port_count,
            clocks = ?caps.input_clocks,
            modes = ?caps.digital_modes,
            min_rate = caps.min_sample_rate,
            max_rate = caps.max_sample_rate,
        );
        enter.exit();

        // Use uni-directional channel for communication to child threads.
        let (tx, rx) = mpsc::sync_channel(32);

        Ok(EchoGalsRuntime {
            card,
            mixer,
            config,
            rx,
            tx,
            dispatchers: Default::default(),
            timer: Default::default(),
            detected_clocks: Default::default(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        self.launch_system_event_dispatcher()?;

        let enter = debug_span!("configure").entered();
        self.configure()?;
        enter.exit();

        self.card.set_meters_on(true)?;
        self.start_interval_timer()?;

        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let enter = debug_span!("event").entered();
        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => continue,
            };

            match ev {
                Event::Shutdown => break,
                Event::Timer => {
                    let _enter = debug_span!("timer").entered();
                    if let Err(e) = self.poll() {
                        warn!("Fail to poll card: {}", e);
                    }
                }
            }
        }

        enter.exit();

        Ok(())
    }
}

impl EchoGalsRuntime {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const TIMER_DISPATCHER_NAME: &'static str = "interval timer dispatcher";

    const TIMER_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

    // The digital mode is applied at first since it limits the rate and the clock.
    fn configure(&mut self) -> Result<(), Error> {
        if let Some(mode) = self.config.digital_mode {
            self.card.set_digital_mode(mode)?;
        }
        if let Some(rate) = self.config.rate {
            let rate = self.card.set_audio_sample_rate(rate)?;
            debug!(rate);
        }
        if let Some(clock) = self.config.clock {
            self.card.set_input_clock(clock)?;
        }
        if self.config.professional_spdif {
            self.card.set_professional_spdif(true)?;
        }

        debug!(
            clock = ?self.card.input_clock()?,
            mode = ?self.card.digital_mode()?,
            rate = self.card.audio_sample_rate()?,
            "configured",
        );

        Ok(())
    }

    fn poll(&mut self) -> Result<(), Error> {
        let stuff = self.card.polled_stuff(self.mixer)?;
        if stuff.clock_detect != self.detected_clocks {
            debug!(detected = ?stuff.clock_detect, "input clock detection");
            self.detected_clocks = stuff.clock_detect;
        }

        let state = self.card.service_mtc_sync()?;
        let midi = self.card.read_midi_input()?;
        if !midi.is_empty() {
            debug!(?midi, "MIDI input");
        }

        self.card
            .control_changes(self.mixer)?
            .iter()
            .for_each(|change| debug!(?change, "control changed"));

        debug!(
            ?state,
            out_vu = ?stuff.meters.bus_out_vu,
            in_vu = ?stuff.meters.bus_in_vu,
        );

        Ok(())
    }

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::SYSTEM_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(signal::Signal::SIGINT, move || {
            let _ = tx.send(Event::Shutdown);
            glib::ControlFlow::Break
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn start_interval_timer(&mut self) -> Result<(), Error> {
        let mut dispatcher = Dispatcher::run(Self::TIMER_DISPATCHER_NAME.to_string())?;
        let tx = self.tx.clone();
        dispatcher.attach_interval_handler(Self::TIMER_INTERVAL, move || {
            let _ = tx.send(Event::Timer);
            glib::ControlFlow::Continue
        });

        self.timer = Some(dispatcher);

        Ok(())
    }
}

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
enum ModelArg {
    Gina24,
    Layla20,
    Layla24,
    Mona,
    Echo3g,
}

impl From<ModelArg> for CardType {
    fn from(model: ModelArg) -> Self {
        match model {
            ModelArg::Gina24 => CardType::Gina24,
            ModelArg::Layla20 => CardType::Layla20,
            ModelArg::Layla24 => CardType::Layla24,
            ModelArg::Mona => CardType::Mona,
            ModelArg::Echo3g => CardType::Echo3g,
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
enum DeviceArg {
    #[value(name = "56301")]
    Dsp56301,
    #[value(name = "56361")]
    Dsp56361,
}

impl From<DeviceArg> for DspDevice {
    fn from(device: DeviceArg) -> Self {
        match device {
            DeviceArg::Dsp56301 => DspDevice::Dsp56301,
            DeviceArg::Dsp56361 => DspDevice::Dsp56361,
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
enum ClockArg {
    Internal,
    Word,
    Super,
    Spdif,
    Adat,
    Esync,
    Mtc,
}

impl From<ClockArg> for InputClock {
    fn from(clock: ClockArg) -> Self {
        match clock {
            ClockArg::Internal => InputClock::Internal,
            ClockArg::Word => InputClock::Word,
            ClockArg::Super => InputClock::Super,
            ClockArg::Spdif => InputClock::Spdif,
            ClockArg::Adat => InputClock::Adat,
            ClockArg::Esync => InputClock::Esync,
            ClockArg::Mtc => InputClock::Mtc,
        }
    }
}

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
enum DigitalModeArg {
    SpdifRca,
    SpdifOptical,
    Adat,
    SpdifCdrom,
}

impl From<DigitalModeArg> for DigitalMode {
    fn from(mode: DigitalModeArg) -> Self {
        match mode {
            DigitalModeArg::SpdifRca => DigitalMode::SpdifRca,
            DigitalModeArg::SpdifOptical => DigitalMode::SpdifOptical,
            DigitalModeArg::Adat => DigitalMode::Adat,
            DigitalModeArg::SpdifCdrom => DigitalMode::SpdifCdrom,
        }
    }
}

struct EchoGalsServiceCmd;

#[derive(Parser)]
#[clap(name = "snd-echogals-ctl-service")]
struct Arguments {
    /// The model of card.
    #[clap(value_enum)]
    model: ModelArg,

    /// The DSP on the card. Layla20 has 56301 and the others have 56361 as a default.
    #[clap(long, short, value_enum)]
    dsp_device: Option<DeviceArg>,

    /// The sampling rate to program.
    #[clap(long, short)]
    rate: Option<u32>,

    /// The source of sampling clock.
    #[clap(long, short, value_enum)]
    clock: Option<ClockArg>,

    /// The mode of digital interface.
    #[clap(long, short = 'm', value_enum)]
    digital_mode: Option<DigitalModeArg>,

    /// Use professional format of S/PDIF output.
    #[clap(long)]
    professional_spdif: bool,

    /// The directory of firmware images, synthetic images are used as a default.
    #[clap(long, short)]
    firmware_dir: Option<PathBuf>,

    /// The number of consecutive stable estimates to lock to MTC.
    #[clap(long)]
    mtc_stable_count: Option<usize>,

    /// The tolerance between estimates of rate by MTC, in parts per million.
    #[clap(long)]
    mtc_tolerance_ppm: Option<u32>,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, ServiceConfig, EchoGalsRuntime> for EchoGalsServiceCmd {
    fn params(args: &Arguments) -> (ServiceConfig, Option<LogLevel>) {
        let mut mtc_params = MtcSyncParams::default();
        if let Some(count) = args.mtc_stable_count {
            mtc_params.stable_count = count;
        }
        if let Some(ppm) = args.mtc_tolerance_ppm {
            mtc_params.tolerance_ppm = ppm;
        }

        let config = ServiceConfig {
            card_type: args.model.into(),
            device: args.dsp_device.map(|device| device.into()),
            rate: args.rate,
            clock: args.clock.map(|clock| clock.into()),
            digital_mode: args.digital_mode.map(|mode| mode.into()),
            professional_spdif: args.professional_spdif,
            firmware_dir: args.firmware_dir.clone(),
            mtc_params,
        };
        (config, args.log_level)
    }
}

fn main() {
    EchoGalsServiceCmd::run()
}
