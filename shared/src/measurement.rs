// Measurement Log Module
// Fixed-size sensor records and the durable append-only log that buffers them
// until a publish batch is confirmed

use std::sync::Mutex;

// Import logging macros
use log::{debug, info, warn};

// Import Serde for the published JSON shape
use serde::Serialize;

use crate::storage::{lock_store, SharedBlobStore, StoreResult};

pub const MEASUREMENT_LOG_BLOB: &str = "meas_log";
pub const MEASUREMENT_RECORD_LEN: usize = 20;

/// One environmental reading, immutable once recorded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub unix_timestamp: u32,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub gas_resistance: f32,
}

impl Measurement {
    pub fn to_bytes(&self) -> [u8; MEASUREMENT_RECORD_LEN] {
        let mut record = [0u8; MEASUREMENT_RECORD_LEN];
        record[0..4].copy_from_slice(&self.unix_timestamp.to_le_bytes());
        record[4..8].copy_from_slice(&self.temperature.to_le_bytes());
        record[8..12].copy_from_slice(&self.humidity.to_le_bytes());
        record[12..16].copy_from_slice(&self.pressure.to_le_bytes());
        record[16..20].copy_from_slice(&self.gas_resistance.to_le_bytes());
        record
    }

    pub fn from_bytes(record: &[u8; MEASUREMENT_RECORD_LEN]) -> Self {
        let word = |at: usize| [record[at], record[at + 1], record[at + 2], record[at + 3]];
        Self {
            unix_timestamp: u32::from_le_bytes(word(0)),
            temperature: f32::from_le_bytes(word(4)),
            humidity: f32::from_le_bytes(word(8)),
            pressure: f32::from_le_bytes(word(12)),
            gas_resistance: f32::from_le_bytes(word(16)),
        }
    }

    /// JSON message published to the cloud for this reading
    pub fn to_message<'a>(&self, peep_uuid: &'a str, hatch_uuid: &'a str) -> MeasurementMessage<'a> {
        MeasurementMessage {
            unix_time: self.unix_timestamp,
            peep_uuid,
            hatch_uuid,
            temperature: self.temperature,
            humidity: self.humidity,
            pressure: self.pressure,
            gas_resistance: self.gas_resistance,
        }
    }
}

/// Published measurement format
#[derive(Debug, Serialize)]
pub struct MeasurementMessage<'a> {
    #[serde(rename = "unixTime")]
    pub unix_time: u32,
    #[serde(rename = "peepUUID")]
    pub peep_uuid: &'a str,
    #[serde(rename = "hatchUUID")]
    pub hatch_uuid: &'a str,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    #[serde(rename = "gasResistance")]
    pub gas_resistance: f32,
}

/// Durable append-only log of Measurement records
pub struct MeasurementLog {
    blobs: SharedBlobStore,
    lock: Mutex<()>,
}

impl MeasurementLog {
    pub fn new(blobs: SharedBlobStore) -> Self {
        Self {
            blobs,
            lock: Mutex::new(()),
        }
    }

    pub fn append(&self, measurement: &Measurement) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "measurement log")?;

        // A power loss mid-append leaves a partial record; cut it so new records stay aligned
        let size = self.blobs.size(MEASUREMENT_LOG_BLOB)?;
        let torn = size % MEASUREMENT_RECORD_LEN;
        if torn != 0 {
            warn!("⚠️ Dropping {} bytes of a torn measurement record", torn);
            let mut bytes = self.blobs.read(MEASUREMENT_LOG_BLOB)?.unwrap_or_default();
            bytes.truncate(size - torn);
            self.blobs.write(MEASUREMENT_LOG_BLOB, &bytes)?;
        }

        self.blobs
            .append(MEASUREMENT_LOG_BLOB, &measurement.to_bytes())?;
        debug!("💾 Measurement at {} appended", measurement.unix_timestamp);
        Ok(())
    }

    /// Number of whole records; a torn trailing record is not counted
    pub fn total(&self) -> StoreResult<usize> {
        let _guard = lock_store(&self.lock, "measurement log")?;
        Ok(self.blobs.size(MEASUREMENT_LOG_BLOB)? / MEASUREMENT_RECORD_LEN)
    }

    /// Every whole record in log order
    pub fn read_all(&self) -> StoreResult<Vec<Measurement>> {
        let _guard = lock_store(&self.lock, "measurement log")?;
        let bytes = self.blobs.read(MEASUREMENT_LOG_BLOB)?.unwrap_or_default();

        let torn = bytes.len() % MEASUREMENT_RECORD_LEN;
        if torn != 0 {
            warn!(
                "⚠️ Ignoring {} trailing bytes of a torn measurement record",
                torn
            );
        }

        Ok(bytes
            .chunks_exact(MEASUREMENT_RECORD_LEN)
            .filter_map(|chunk| <&[u8; MEASUREMENT_RECORD_LEN]>::try_from(chunk).ok())
            .map(Measurement::from_bytes)
            .collect())
    }

    /// Drop every record; only after a confirmed publish batch
    pub fn delete_all(&self) -> StoreResult<()> {
        let _guard = lock_store(&self.lock, "measurement log")?;
        self.blobs.remove(MEASUREMENT_LOG_BLOB)?;
        info!("💾 Measurement log cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryBlobStore;
    use crate::storage::BlobStore;
    use std::sync::Arc;

    fn reading(unix_timestamp: u32) -> Measurement {
        Measurement {
            unix_timestamp,
            temperature: 37.5,
            humidity: 55.25,
            pressure: 101_325.0,
            gas_resistance: 12_000.0,
        }
    }

    #[test]
    fn test_total_survives_restart() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let log = MeasurementLog::new(blobs.clone());
        for ts in 0..7 {
            log.append(&reading(1_000 + ts)).unwrap();
        }
        drop(log);

        let log = MeasurementLog::new(blobs);
        assert_eq!(log.total().unwrap(), 7);
        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(records[0], reading(1_000));
        assert_eq!(records[6], reading(1_006));
    }

    #[test]
    fn test_delete_all_empties_log() {
        let log = MeasurementLog::new(Arc::new(MemoryBlobStore::new()));
        log.append(&reading(1)).unwrap();
        log.delete_all().unwrap();

        assert_eq!(log.total().unwrap(), 0);
        assert!(log.read_all().unwrap().is_empty());
        // Clearing an empty log is not an error
        log.delete_all().unwrap();
    }

    #[test]
    fn test_torn_record_is_skipped() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let log = MeasurementLog::new(blobs.clone());
        log.append(&reading(1)).unwrap();
        blobs.append(MEASUREMENT_LOG_BLOB, &[1, 2, 3]).unwrap();

        assert_eq!(log.total().unwrap(), 1);
        assert_eq!(log.read_all().unwrap(), vec![reading(1)]);

        log.append(&reading(2)).unwrap();
        assert_eq!(log.read_all().unwrap(), vec![reading(1), reading(2)]);
    }

    #[test]
    fn test_message_field_names() {
        let json = serde_json::to_value(reading(42).to_message("peep-1", "hatch-1")).unwrap();
        assert_eq!(json["unixTime"], 42);
        assert_eq!(json["peepUUID"], "peep-1");
        assert_eq!(json["hatchUUID"], "hatch-1");
        assert_eq!(json["temperature"], 37.5);
        assert_eq!(json["gasResistance"], 12_000.0);
    }
}
