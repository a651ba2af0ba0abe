pub mod acquisition;
#[cfg(feature = "caen")]
pub mod caen;
pub mod config;
pub mod controller;
pub mod dgtz;
pub mod digitizer_params;
pub mod hardware;
pub mod monitor;
pub mod sim;
pub mod stream;
pub mod writer;

pub use acquisition::{AcquisitionError, AcquisitionLoop, RunPlan, RunSummary};
#[cfg(feature = "caen")]
pub use caen::CaenDigitizer;
pub use config::{
    AcquisitionSettings, ChannelSetting, Conf, ConfigError, FpgaSettings, GeneralSettings,
    OutputSettings, ReadoutMode, Settings, TriggerMode,
};
pub use controller::{post_trigger_percent, DeviceSession, DigitizerController, RawBatch};
pub use dgtz::{DgtzErrorCode, PulsePolarity, TriggerPolarity};
pub use hardware::{BoardInfo, Digitizer, HardwareError, HwResult};
pub use monitor::{Counter, LogMonitor, Monitor, StatusLine};
pub use sim::{SampleSource, SimDigitizer};
pub use stream::{DecodedEvent, EventStream};
pub use writer::{downsampled_mean, ChannelMean, WaveformSink};
