// NVS Store Module
// Blob storage for every persisted record (state, hatch config, credentials,
// identity and the measurement log) in one NVS namespace

use std::sync::Mutex;

// Import ESP-IDF's NVS (Non-Volatile Storage) functionality
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

// Import ESP-IDF error type for operation results
use esp_idf_svc::sys::EspError;

// Import logging macros
use log::{debug, info};

use peep_shared::storage::{BlobStore, StoreError, StoreResult};

// All peep records live in this namespace; erasing it is a full wipe
const NVS_NAMESPACE: &str = "peep";

pub struct NvsBlobStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
}

impl NvsBlobStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        info!("💾 NVS namespace '{}' opened", NVS_NAMESPACE);
        Ok(Self {
            nvs: Mutex::new(nvs),
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, EspNvs<NvsDefault>>> {
        self.nvs
            .lock()
            .map_err(|_| StoreError::LockPoisoned("nvs"))
    }
}

fn backend(action: &str, name: &str, e: EspError) -> StoreError {
    StoreError::Backend(format!("Failed to {} '{}': {:?}", action, name, e))
}

// Both callers hold the namespace lock
fn read_locked(nvs: &EspNvs<NvsDefault>, name: &str) -> StoreResult<Option<Vec<u8>>> {
    let len = match nvs.blob_len(name).map_err(|e| backend("size", name, e))? {
        Some(len) => len,
        None => return Ok(None),
    };

    let mut buf = vec![0u8; len];
    let data = nvs
        .get_raw(name, &mut buf)
        .map_err(|e| backend("read", name, e))?;
    Ok(data.map(|bytes| bytes.to_vec()))
}

impl BlobStore for NvsBlobStore {
    fn read(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let nvs = self.lock()?;
        read_locked(&nvs, name)
    }

    fn write(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        let mut nvs = self.lock()?;
        nvs.set_raw(name, data)
            .map_err(|e| backend("write", name, e))?;
        debug!("💾 Wrote {} bytes to '{}'", data.len(), name);
        Ok(())
    }

    // NVS has no append; the blob is rewritten under the lock
    fn append(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        let mut nvs = self.lock()?;
        let mut blob = read_locked(&nvs, name)?.unwrap_or_default();
        blob.extend_from_slice(data);
        nvs.set_raw(name, &blob)
            .map_err(|e| backend("append to", name, e))?;
        debug!("💾 '{}' grew to {} bytes", name, blob.len());
        Ok(())
    }

    fn size(&self, name: &str) -> StoreResult<usize> {
        let nvs = self.lock()?;
        let len = nvs.blob_len(name).map_err(|e| backend("size", name, e))?;
        Ok(len.unwrap_or(0))
    }

    fn remove(&self, name: &str) -> StoreResult<()> {
        let mut nvs = self.lock()?;
        nvs.remove(name).map_err(|e| backend("remove", name, e))?;
        Ok(())
    }
}
