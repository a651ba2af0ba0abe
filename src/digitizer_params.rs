use crate::{BoardInfo, Digitizer};
use log::{debug, info};

/// Board-level registers read back after configuration (address, name).
const BOARD_REGISTERS: &[(u32, &str)] = &[
    (0x8000, "BoardConfiguration"),
    (0x800C, "BufferOrganization"),
    (0x8020, "CustomSize"),
    (0x8100, "AcquisitionControl"),
    (0x8104, "AcquisitionStatus"),
    (0x810C, "GlobalTriggerMask"),
    (0x8110, "FrontPanelTrgOutEnableMask"),
    (0x811C, "FrontPanelIOControl"),
    (0x8120, "ChannelEnableMask"),
    (0x8124, "RocFpgaFirmwareRevision"),
    (0x812C, "EventStored"),
    (0x814C, "EventSize"),
    (0xEF00, "ReadoutControl"),
    (0xEF04, "ReadoutStatus"),
    (0xEF1C, "MaxEventsPerBlt"),
];

/// Channel registers; the channel's address is `base + 0x100 * channel`.
const CHANNEL_REGISTERS: &[(u32, &str)] = &[
    (0x1060, "TriggerThreshold"),
    (0x1080, "PulsePolarity"),
    (0x1088, "ChannelStatus"),
    (0x108C, "AmcFirmwareRevision"),
    (0x1098, "DcOffset"),
];

pub fn log_board_info(board: &BoardInfo) {
    info!(
        "Connected to CAEN Digitizer Model {}\n\
         ROC FPGA Release is {}\n\
         AMC FPGA Release is {}\n\
         Serial number: {}\n\
         Channels: {}, ADC bits: {}, family code: {}, form factor: {}\n\
         License: {}",
        board.model_name,
        board.roc_firmware,
        board.amc_firmware,
        board.serial_number,
        board.channels,
        board.adc_bits,
        board.family_code,
        board.form_factor,
        board.license,
    );
}

/// Dump the registers that reflect the programmed configuration.
///
/// Registers the board refuses to read are left out.
pub fn log_registers<D: Digitizer>(hw: &mut D, n_channels: u32) {
    let mut param_log = String::new();

    for &(address, name) in BOARD_REGISTERS {
        if let Ok(value) = hw.read_register(address) {
            param_log.push_str(&format!("{} ({:#06x}): {:#010x}\n", name, address, value));
        }
    }

    for &(base, name) in CHANNEL_REGISTERS {
        for ch in 0..n_channels {
            let address = base + 0x100 * ch;
            match hw.read_register(address) {
                Ok(value) => {
                    param_log.push_str(&format!("{}[{}]: {:#010x}\n", name, ch, value));
                }
                Err(_) => {
                    continue;
                }
            }
        }
    }

    if param_log.ends_with('\n') {
        param_log.pop();
    }
    debug!("Digitizer registers:\n{}", param_log);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dgtz::{ConnectionType, DgtzErrorCode};
    use crate::sim::Call;
    use crate::SimDigitizer;

    #[test]
    fn reads_board_and_channel_registers() {
        let mut sim = SimDigitizer::new();
        sim.open(ConnectionType::Usb, 0, 0, 0).unwrap();
        log_registers(&mut sim, 2);

        let reads: Vec<u32> = sim
            .calls()
            .iter()
            .filter_map(|c| match c {
                Call::ReadRegister(address) => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(reads.len(), BOARD_REGISTERS.len() + 2 * CHANNEL_REGISTERS.len());
        assert!(reads.contains(&0x8100));
        assert!(reads.contains(&0x1160));
    }

    #[test]
    fn unreadable_registers_are_skipped() {
        let mut sim = SimDigitizer::new().fail_on("read_register", DgtzErrorCode::CommError);
        sim.open(ConnectionType::Usb, 0, 0, 0).unwrap();
        // must not panic or stop early
        log_registers(&mut sim, 1);
        assert_eq!(
            sim.calls().len(),
            1 + BOARD_REGISTERS.len() + CHANNEL_REGISTERS.len()
        );
    }
}
