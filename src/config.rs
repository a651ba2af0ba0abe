use crate::dgtz::{PulsePolarity, TriggerPolarity};
use confique::Config;
use log::{info, warn};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Configuration file as written by the operator.
///
/// Every key is optional at this level so that a single load can report all
/// missing or malformed settings at once; [`Conf::validate`] turns it into
/// [`Settings`].
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub general: GeneralConf,
    #[config(nested)]
    pub digitizer: DigitizerConf,
    #[config(nested)]
    pub fpga: FpgaConf,
    #[config(nested)]
    pub output: OutputConf,
}

#[derive(Config, Debug, Clone)]
pub struct GeneralConf {
    pub read_out_mode: Option<i64>,
    pub number_frames_in_reference_image: Option<i64>,
}

#[derive(Config, Debug, Clone)]
pub struct DigitizerConf {
    pub sampling_rate: Option<f64>,
    pub n_samples_per_trigger: Option<i64>,
    pub post_trigger_fraction: Option<f64>,
    pub max_number_events_transferred: Option<i64>,
    pub use_external_clock: Option<i64>,
    pub trigger_polarity: Option<i64>,
    pub trigger_threshold: Option<i64>,
    pub trigger_mode: Option<i64>,
    #[config(default = 0)]
    pub dc_offset: i64,
    pub number_of_boards: Option<i64>,
    pub channels: Option<Vec<ChannelConf>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChannelConf {
    pub channel: i64,
    pub dc_offset: Option<i64>,
    #[serde(default)]
    pub polarity: PulsePolarity,
    #[serde(default)]
    pub trigger_source: bool,
}

#[derive(Config, Debug, Clone)]
pub struct FpgaConf {
    pub stop_address_mode: Option<bool>,
    pub stop_address: Option<i64>,
}

#[derive(Config, Debug, Clone)]
pub struct OutputConf {
    pub filename: Option<String>,
    pub waveform_downsample: Option<i64>,
    pub channels: Option<Vec<i64>>,
    #[config(default = 1)]
    pub verbose: u8,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),
    #[error("failed to load config file: {0}")]
    Load(#[from] confique::Error),
    #[error("failed to parse config:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerMode {
    Continuous,
    SelfTrigger,
    SoftwareTrigger,
    ExternalTrigger,
}

impl TryFrom<i64> for TriggerMode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Continuous),
            1 => Ok(Self::SelfTrigger),
            2 => Ok(Self::SoftwareTrigger),
            3 => Ok(Self::ExternalTrigger),
            other => Err(other),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TriggerMode::Continuous => "Continuous",
            TriggerMode::SelfTrigger => "SelfTrigger",
            TriggerMode::SoftwareTrigger => "SoftwareTrigger",
            TriggerMode::ExternalTrigger => "ExternalTrigger",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadoutMode {
    SinglePixel,
    FullReadoutWaveform,
    FullReadoutAverage,
}

impl TryFrom<i64> for ReadoutMode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SinglePixel),
            1 => Ok(Self::FullReadoutWaveform),
            2 => Ok(Self::FullReadoutAverage),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSetting {
    pub channel: u32,
    pub dc_offset: u16,
    pub polarity: PulsePolarity,
    pub trigger_source: bool,
}

/// Everything the digitizer controller needs; never mutated once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// MHz
    pub sampling_rate: f64,
    pub samples_per_trigger: u32,
    pub post_trigger_fraction: f64,
    pub max_events_per_transfer: u32,
    pub trigger_mode: TriggerMode,
    pub trigger_polarity: TriggerPolarity,
    pub trigger_threshold: u32,
    pub acquisition_offset: u16,
    pub number_of_boards: u32,
    pub use_external_clock: bool,
    pub channels: Vec<ChannelSetting>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralSettings {
    pub readout_mode: ReadoutMode,
    pub frames_in_reference_image: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FpgaSettings {
    pub stop_address_enabled: bool,
    pub stop_address: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub filename: PathBuf,
    pub waveform_downsample: usize,
    /// Channels written to the output file, always a subset of the configured ones.
    pub persist_channels: BTreeSet<u32>,
    pub verbose: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_file: PathBuf,
    pub general: GeneralSettings,
    pub acquisition: AcquisitionSettings,
    pub fpga: FpgaSettings,
    pub output: OutputSettings,
}

/// Collects every problem found while validating instead of stopping at the first.
#[derive(Default)]
struct Diagnostics(Vec<String>);

impl Diagnostics {
    fn missing(&mut self, name: &str) {
        warn!("Missing element: {}", name);
        self.0.push(format!("missing {}", name));
    }

    fn invalid(&mut self, name: &str, reason: impl fmt::Display) {
        warn!("Invalid element: {}: {}", name, reason);
        self.0.push(format!("invalid {}: {}", name, reason));
    }

    /// Require `value` and convert it, recording whatever goes wrong under `name`.
    fn take<T, U, E: fmt::Display>(
        &mut self,
        name: &str,
        value: Option<T>,
        convert: impl FnOnce(T) -> Result<U, E>,
    ) -> Option<U> {
        match value {
            None => {
                self.missing(name);
                None
            }
            Some(v) => match convert(v) {
                Ok(u) => Some(u),
                Err(e) => {
                    self.invalid(name, e);
                    None
                }
            },
        }
    }
}

fn positive_u32(value: i64) -> Result<u32, String> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(format!("{} is not a positive integer", value)),
    }
}

fn non_negative_u32(value: i64) -> Result<u32, String> {
    u32::try_from(value).map_err(|_| format!("{} is out of range", value))
}

fn dc_offset(value: i64) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("{} does not fit in 16 bits", value))
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
        let path = path.as_ref();
        info!("Reading config file {}", path.display());
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Conf::from_file(path)?.validate(path)
    }

    pub fn validate(self, config_file: &Path) -> Result<Settings, ConfigError> {
        let mut diag = Diagnostics::default();

        let general = self.general.validate(&mut diag);
        let acquisition = self.digitizer.validate(&mut diag);
        let fpga = self.fpga.validate(&mut diag);
        let output = self.output.validate(acquisition.as_ref(), &mut diag);

        match (general, acquisition, fpga, output) {
            (Some(general), Some(acquisition), Some(fpga), Some(output)) if diag.0.is_empty() => {
                Ok(Settings {
                    config_file: config_file.to_path_buf(),
                    general,
                    acquisition,
                    fpga,
                    output,
                })
            }
            _ => Err(ConfigError::Invalid(diag.0)),
        }
    }
}

impl GeneralConf {
    fn validate(self, diag: &mut Diagnostics) -> Option<GeneralSettings> {
        let readout_mode = diag.take("general:read_out_mode", self.read_out_mode, |v| {
            ReadoutMode::try_from(v).map_err(|v| format!("unknown readout mode {}", v))
        });
        let frames = diag.take(
            "general:number_frames_in_reference_image",
            self.number_frames_in_reference_image,
            non_negative_u32,
        );
        Some(GeneralSettings {
            readout_mode: readout_mode?,
            frames_in_reference_image: frames?,
        })
    }
}

impl DigitizerConf {
    fn validate(self, diag: &mut Diagnostics) -> Option<AcquisitionSettings> {
        let sampling_rate = diag.take("digitizer:sampling_rate", self.sampling_rate, |v| {
            if v > 0.0 {
                Ok(v)
            } else {
                Err(format!("{} MHz is not a positive rate", v))
            }
        });
        let samples_per_trigger = diag.take(
            "digitizer:n_samples_per_trigger",
            self.n_samples_per_trigger,
            positive_u32,
        );
        let post_trigger_fraction = diag.take(
            "digitizer:post_trigger_fraction",
            self.post_trigger_fraction,
            |v| {
                if (0.0..=1.0).contains(&v) {
                    Ok(v)
                } else {
                    Err(format!("{} is outside [0, 1]", v))
                }
            },
        );
        let max_events_per_transfer = diag.take(
            "digitizer:max_number_events_transferred",
            self.max_number_events_transferred,
            positive_u32,
        );
        let use_external_clock =
            diag.take("digitizer:use_external_clock", self.use_external_clock, |v| {
                match v {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(format!("{} is neither 0 nor 1", other)),
                }
            });
        let trigger_polarity =
            diag.take("digitizer:trigger_polarity", self.trigger_polarity, |v| {
                TriggerPolarity::try_from(v).map_err(|v| format!("unknown polarity {}", v))
            });
        let trigger_threshold = diag.take(
            "digitizer:trigger_threshold",
            self.trigger_threshold,
            non_negative_u32,
        );
        let trigger_mode = diag.take("digitizer:trigger_mode", self.trigger_mode, |v| {
            TriggerMode::try_from(v).map_err(|v| format!("unknown trigger mode {}", v))
        });
        let acquisition_offset = diag.take("digitizer:dc_offset", Some(self.dc_offset), dc_offset);
        let number_of_boards = diag.take(
            "digitizer:number_of_boards",
            self.number_of_boards,
            positive_u32,
        );
        let channels = diag.take("digitizer:channels", self.channels, |channels| {
            if channels.is_empty() {
                Err("at least one channel is required".to_string())
            } else {
                Ok(channels)
            }
        });
        let channels = channels.and_then(|channels| {
            validate_channels(channels, acquisition_offset.unwrap_or_default(), diag)
        });

        if trigger_mode == Some(TriggerMode::SelfTrigger)
            && channels
                .as_ref()
                .is_some_and(|chs| !chs.iter().any(|ch| ch.trigger_source))
        {
            warn!("Self trigger selected but no channel is marked as trigger source");
        }

        Some(AcquisitionSettings {
            sampling_rate: sampling_rate?,
            samples_per_trigger: samples_per_trigger?,
            post_trigger_fraction: post_trigger_fraction?,
            max_events_per_transfer: max_events_per_transfer?,
            trigger_mode: trigger_mode?,
            trigger_polarity: trigger_polarity?,
            trigger_threshold: trigger_threshold?,
            acquisition_offset: acquisition_offset?,
            number_of_boards: number_of_boards?,
            use_external_clock: use_external_clock?,
            channels: channels?,
        })
    }
}

fn validate_channels(
    channels: Vec<ChannelConf>,
    default_offset: u16,
    diag: &mut Diagnostics,
) -> Option<Vec<ChannelSetting>> {
    let before = diag.0.len();
    let mut seen = HashSet::new();
    let mut settings = Vec::with_capacity(channels.len());
    for ch in channels {
        let name = format!("digitizer:channels[{}]", ch.channel);
        let channel = match u32::try_from(ch.channel) {
            Ok(c) if c < 32 => c,
            _ => {
                diag.invalid(&name, "channel index must be within 0..32");
                continue;
            }
        };
        if !seen.insert(channel) {
            diag.invalid(&name, "channel listed more than once");
            continue;
        }
        let offset = match ch.dc_offset.map(dc_offset) {
            None => default_offset,
            Some(Ok(offset)) => offset,
            Some(Err(e)) => {
                diag.invalid(&format!("{}:dc_offset", name), e);
                continue;
            }
        };
        settings.push(ChannelSetting {
            channel,
            dc_offset: offset,
            polarity: ch.polarity,
            trigger_source: ch.trigger_source,
        });
    }
    (diag.0.len() == before).then_some(settings)
}

impl FpgaConf {
    fn validate(self, diag: &mut Diagnostics) -> Option<FpgaSettings> {
        let stop_address_enabled =
            diag.take("fpga:stop_address_mode", self.stop_address_mode, Ok::<_, String>);
        let stop_address = diag.take("fpga:stop_address", self.stop_address, non_negative_u32);
        Some(FpgaSettings {
            stop_address_enabled: stop_address_enabled?,
            stop_address: stop_address?,
        })
    }
}

impl OutputConf {
    fn validate(
        self,
        acquisition: Option<&AcquisitionSettings>,
        diag: &mut Diagnostics,
    ) -> Option<OutputSettings> {
        let filename = diag.take("output:filename", self.filename, |name| {
            if name.trim().is_empty() {
                Err("file name is empty".to_string())
            } else {
                Ok(PathBuf::from(name))
            }
        });
        let waveform_downsample = diag.take(
            "output:waveform_downsample",
            self.waveform_downsample,
            |v| positive_u32(v).map(|v| v as usize),
        );

        let configured: Option<BTreeSet<u32>> =
            acquisition.map(|acq| acq.channels.iter().map(|ch| ch.channel).collect());
        let persist_channels = match (self.channels, configured) {
            (None, configured) => configured,
            (Some(requested), configured) => {
                let mut persist = BTreeSet::new();
                for ch in requested {
                    match u32::try_from(ch) {
                        Ok(c) if configured.as_ref().map_or(true, |set| set.contains(&c)) => {
                            persist.insert(c);
                        }
                        _ => diag.invalid(
                            "output:channels",
                            format!("channel {} is not a configured digitizer channel", ch),
                        ),
                    }
                }
                configured.map(|_| persist)
            }
        };

        Some(OutputSettings {
            filename: filename?,
            waveform_downsample: waveform_downsample?,
            persist_channels: persist_channels?,
            verbose: self.verbose,
        })
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let acq = &self.acquisition;
        writeln!(f, "Top Metal II- Control Settings")?;
        writeln!(f, "General Settings")?;
        writeln!(f, "\tConfiguration Filename: {}", self.config_file.display())?;
        writeln!(f, "\tReadout Mode: {:?}", self.general.readout_mode)?;
        writeln!(
            f,
            "\tNumber of Frames in Reference Image: {}",
            self.general.frames_in_reference_image
        )?;
        writeln!(f, "Digitizer Settings")?;
        writeln!(f, "\tSampling Rate (MHz): {}", acq.sampling_rate)?;
        writeln!(f, "\tNumber of Samples Per Trigger: {}", acq.samples_per_trigger)?;
        writeln!(
            f,
            "\tFraction of Waveform Post Trigger: {}",
            acq.post_trigger_fraction
        )?;
        writeln!(f, "\tTrigger Mode: {}", acq.trigger_mode)?;
        writeln!(f, "\tTrigger Threshold: {}", acq.trigger_threshold)?;
        writeln!(f, "\tTrigger Polarity: {:?}", acq.trigger_polarity)?;
        writeln!(
            f,
            "\tMaximum Number of Events Transferred per Read: {}",
            acq.max_events_per_transfer
        )?;
        writeln!(
            f,
            "\tDC Offset of Dynamic Voltage Range: {:#06x}",
            acq.acquisition_offset
        )?;
        writeln!(f, "\tNumber of Digitizer Boards: {}", acq.number_of_boards)?;
        writeln!(f, "\tExternal Clock: {}", acq.use_external_clock)?;
        for ch in &acq.channels {
            writeln!(
                f,
                "\tChannel {}: DC offset {:#06x}, {:?} polarity{}",
                ch.channel,
                ch.dc_offset,
                ch.polarity,
                if ch.trigger_source { ", trigger source" } else { "" }
            )?;
        }
        writeln!(f, "FPGA Settings")?;
        writeln!(
            f,
            "\tFPGA Stop Address Enabled: {}",
            self.fpga.stop_address_enabled
        )?;
        writeln!(f, "\tFPGA Stop Address Value: {}", self.fpga.stop_address)?;
        writeln!(f, "Output Settings")?;
        writeln!(f, "\tOutput filename: {}", self.output.filename.display())?;
        writeln!(
            f,
            "\tWaveform Downsampling Factor: {}",
            self.output.waveform_downsample
        )?;
        write!(
            f,
            "\tPersisted Channels: {:?}",
            self.output.persist_channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[general]
read_out_mode = 1
number_frames_in_reference_image = 10

[digitizer]
sampling_rate = 250.0
n_samples_per_trigger = 1024
post_trigger_fraction = 0.25
max_number_events_transferred = 100
use_external_clock = 0
trigger_polarity = 1
trigger_threshold = 8200
trigger_mode = 1
dc_offset = 4096
number_of_boards = 1

[[digitizer.channels]]
channel = 0
trigger_source = true

[[digitizer.channels]]
channel = 3
dc_offset = 32768
polarity = "Negative"

[fpga]
stop_address_mode = true
stop_address = 4000

[output]
filename = "run.dat"
waveform_downsample = 4
"#;

    fn write_config(dir: &tempfile::TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("topmetal.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    fn invalid(err: ConfigError) -> Vec<String> {
        match err {
            ConfigError::Invalid(list) => list,
            other => panic!("expected validation failure, got {other}"),
        }
    }

    #[test]
    fn loads_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, FULL);
        let settings = Conf::load(&path).unwrap();

        assert_eq!(settings.general.readout_mode, ReadoutMode::FullReadoutWaveform);
        let acq = &settings.acquisition;
        assert_eq!(acq.trigger_mode, TriggerMode::SelfTrigger);
        assert_eq!(acq.trigger_polarity, TriggerPolarity::Falling);
        assert_eq!(acq.acquisition_offset, 4096);
        assert!(!acq.use_external_clock);
        assert_eq!(
            acq.channels,
            vec![
                ChannelSetting {
                    channel: 0,
                    dc_offset: 4096,
                    polarity: PulsePolarity::Positive,
                    trigger_source: true,
                },
                ChannelSetting {
                    channel: 3,
                    dc_offset: 32768,
                    polarity: PulsePolarity::Negative,
                    trigger_source: false,
                },
            ]
        );
        assert_eq!(settings.output.waveform_downsample, 4);
        assert_eq!(settings.output.verbose, 1);
        assert_eq!(
            settings.output.persist_channels,
            BTreeSet::from([0, 3])
        );
        assert!(settings.fpga.stop_address_enabled);
    }

    #[test]
    fn dc_offset_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &FULL.replace("dc_offset = 4096\n", ""));
        let settings = Conf::load(&path).unwrap();
        assert_eq!(settings.acquisition.acquisition_offset, 0);
        assert_eq!(settings.acquisition.channels[0].dc_offset, 0);
    }

    #[test]
    fn missing_filename_fails_and_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &FULL.replace("filename = \"run.dat\"\n", ""));
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(problems, vec!["missing output:filename".to_string()]);
        assert!(!dir.path().join("run.dat").exists());
    }

    #[test]
    fn reports_every_missing_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL
            .replace("sampling_rate = 250.0\n", "")
            .replace("stop_address = 4000\n", "")
            .replace("number_frames_in_reference_image = 10\n", "");
        let path = write_config(&dir, &text);
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(
            problems,
            vec![
                "missing general:number_frames_in_reference_image".to_string(),
                "missing digitizer:sampling_rate".to_string(),
                "missing fpga:stop_address".to_string(),
            ]
        );
    }

    #[test]
    fn missing_group_reports_each_key() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL.replace(
            "[fpga]\nstop_address_mode = true\nstop_address = 4000\n",
            "",
        );
        let path = write_config(&dir, &text);
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(
            problems,
            vec![
                "missing fpga:stop_address_mode".to_string(),
                "missing fpga:stop_address".to_string(),
            ]
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL
            .replace("trigger_mode = 1", "trigger_mode = 7")
            .replace("post_trigger_fraction = 0.25", "post_trigger_fraction = 1.5")
            .replace("waveform_downsample = 4", "waveform_downsample = 0");
        let path = write_config(&dir, &text);
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(problems.len(), 3);
        assert!(problems[0].starts_with("invalid digitizer:post_trigger_fraction"));
        assert!(problems[1].starts_with("invalid digitizer:trigger_mode"));
        assert!(problems[2].starts_with("invalid output:waveform_downsample"));
    }

    #[test]
    fn persisted_channels_must_be_configured() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL.replace(
            "waveform_downsample = 4\n",
            "waveform_downsample = 4\nchannels = [3, 5]\n",
        );
        let path = write_config(&dir, &text);
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(
            problems,
            vec!["invalid output:channels: channel 5 is not a configured digitizer channel"
                .to_string()]
        );
    }

    #[test]
    fn duplicate_channels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let text = FULL.replace("channel = 3\n", "channel = 0\n");
        let path = write_config(&dir, &text);
        let problems = invalid(Conf::load(&path).unwrap_err());
        assert_eq!(
            problems,
            vec!["invalid digitizer:channels[0]: channel listed more than once".to_string()]
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = Conf::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn settings_dump_names_the_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, FULL);
        let dump = Conf::load(&path).unwrap().to_string();
        assert!(dump.contains("Trigger Mode: SelfTrigger"));
        assert!(dump.contains("Output filename: run.dat"));
        assert!(dump.contains("Channel 3: DC offset 0x8000, Negative polarity"));
    }
}
