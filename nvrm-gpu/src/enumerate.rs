// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovery of usable GPUs.

use std::sync::Arc;

use log::{debug, info};

use nvrm_client::client::{card_info, check_version};
use nvrm_client::params::DRIVER_VERSION;
use nvrm_client::RmTransport;
use nvrm_common::status;
use nvrm_common::Settings;

use crate::device::Device;
use crate::error::{GpuError, GpuResult};

/// Open every card the resource manager reports. Cards whose driver rejects
/// this client's version are skipped; any other failure is returned.
pub fn enumerate(transport: Arc<dyn RmTransport>, settings: &Settings) -> GpuResult<Vec<Arc<Device>>> {
    let cards = card_info(transport.as_ref())?;
    debug!("enumerate: {} card(s) reported", cards.len());

    let mut devices = Vec::with_capacity(cards.len());
    for card in &cards {
        let opened = check_version(transport.as_ref(), DRIVER_VERSION)
            .map_err(GpuError::from)
            .and_then(|()| Device::open(transport.clone(), card, settings));
        match opened {
            Ok(device) => devices.push(device),
            Err(e) if e.is_status(status::NV_ERR_LIB_RM_VERSION_MISMATCH) => {
                debug!(
                    "enumerate: skipping minor {} (gpu 0x{:X}): version mismatch",
                    card.minor_number, card.gpu_id
                );
            }
            Err(e) => return Err(e),
        }
    }
    info!("enumerate: {} of {} card(s) usable", devices.len(), cards.len());
    Ok(devices)
}

/// Open the first usable card.
pub fn open_first(transport: Arc<dyn RmTransport>, settings: &Settings) -> GpuResult<Arc<Device>> {
    enumerate(transport, settings)?
        .into_iter()
        .next()
        .ok_or(GpuError::NoDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvrm_sim::{SimConfig, SoftRm};

    fn sim(cards: u32) -> Arc<SoftRm> {
        SoftRm::new(SimConfig {
            cards,
            ..SimConfig::default()
        })
    }

    #[test]
    fn test_enumerate_opens_every_card() {
        let rm = sim(3);
        let devices = enumerate(rm.clone(), &Settings::default()).unwrap();
        let minors: Vec<u32> = devices.iter().map(|d| d.card().minor_number).collect();
        assert_eq!(minors, [0, 1, 2]);
    }

    #[test]
    fn test_mismatched_card_is_skipped() {
        let rm = sim(2);
        rm.mismatch_device(0);
        let devices = enumerate(rm.clone(), &Settings::default()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].card().minor_number, 1);
        drop(devices);
        assert_eq!(rm.stats().live_objects, 0);
    }

    #[test]
    fn test_rejected_version_leaves_no_device() {
        let rm = sim(2);
        rm.reject_version(true);
        assert!(enumerate(rm.clone(), &Settings::default()).unwrap().is_empty());
        assert!(matches!(
            open_first(rm.clone(), &Settings::default()),
            Err(GpuError::NoDevice)
        ));
    }

    #[test]
    fn test_other_failures_abort() {
        let rm = sim(1);
        rm.fail_nth_call(1);
        let err = enumerate(rm.clone(), &Settings::default()).unwrap_err();
        assert!(err.is_status(status::NV_ERR_GENERIC));
        rm.clear_failure();
        assert!(open_first(rm.clone(), &Settings::default()).is_ok());
    }
}
