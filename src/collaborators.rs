// THEORY:
// The trigger runs inside a larger application that owns the network, the
// settings store and the device sensors. This module is the seam to that
// application: two small traits the pipeline calls out through, plus simple
// implementations that are enough for tests and the demo binary.

use crate::core_modules::acquisition_block::BlockSnapshot;
use crate::core_modules::calibrator::CalibrationSummary;
use crate::core_modules::frame::GeoLocation;
use crate::core_modules::precalibration::PrecalibrationResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Receives everything the pipeline produces for upload. Calls come from
/// worker tasks and the flush loop and must not block.
pub trait ExportSink: Send + Sync {
    fn export_block(&self, block: BlockSnapshot);
    fn export_calibration(&self, summary: CalibrationSummary);
    fn export_precalibration(&self, result: PrecalibrationResult);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportRecord {
    Block(BlockSnapshot),
    Calibration(CalibrationSummary),
    Precalibration(PrecalibrationResult),
}

/// Forwards every export into an unbounded channel.
pub struct ChannelExportSink {
    sender: mpsc::UnboundedSender<ExportRecord>,
}

impl ChannelExportSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExportRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, record: ExportRecord) {
        if self.sender.send(record).is_err() {
            log::warn!("export receiver is gone; record discarded");
        }
    }
}

impl ExportSink for ChannelExportSink {
    fn export_block(&self, block: BlockSnapshot) {
        self.send(ExportRecord::Block(block));
    }

    fn export_calibration(&self, summary: CalibrationSummary) {
        self.send(ExportRecord::Calibration(summary));
    }

    fn export_precalibration(&self, result: PrecalibrationResult) {
        self.send(ExportRecord::Precalibration(result));
    }
}

/// Device readings that are copied into every block.
pub trait DeviceStatus: Send + Sync {
    /// Battery temperature in degrees Celsius.
    fn battery_temperature(&self) -> Option<f32>;
    fn location(&self) -> Option<GeoLocation>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticDeviceStatus {
    pub battery_temperature: Option<f32>,
    pub location: Option<GeoLocation>,
}

impl DeviceStatus for StaticDeviceStatus {
    fn battery_temperature(&self) -> Option<f32> {
        self.battery_temperature
    }

    fn location(&self) -> Option<GeoLocation> {
        self.location
    }
}
